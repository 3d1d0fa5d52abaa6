//! Log throttling utility
//!
//! Limits how often the same message is recorded so that a capture device
//! without signal does not flood the log with one timeout per second.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use webcam_recorder::utils::LogThrottler;
///
/// let mut throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("capture_timeout"));
/// assert!(!throttler.should_log("capture_timeout"));
/// ```
#[derive(Debug)]
pub struct LogThrottler {
    last_logged: HashMap<&'static str, Instant>,
    /// Occurrences swallowed since the key was last logged
    suppressed: HashMap<&'static str, u64>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: HashMap::new(),
            suppressed: HashMap::new(),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message should be logged now.
    ///
    /// A `false` return counts the occurrence as suppressed.
    pub fn should_log(&mut self, key: &'static str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_logged.get(key) {
            if now.duration_since(*last) < self.interval {
                *self.suppressed.entry(key).or_insert(0) += 1;
                return false;
            }
        }
        self.last_logged.insert(key, now);
        true
    }

    /// Take the number of suppressed occurrences for `key`, resetting it
    pub fn take_suppressed(&mut self, key: &'static str) -> u64 {
        self.suppressed.remove(key).unwrap_or(0)
    }
}

/// Throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}
