use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::video::format::Resolution;

/// Recording session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    /// Capture device path (e.g., /dev/video0)
    pub device_path: PathBuf,
    /// Output container file; the format is inferred from the extension
    pub output_path: PathBuf,
    /// Requested capture resolution (the driver may negotiate another one)
    pub resolution: Resolution,
    /// Target frame rate
    pub fps: u32,
    /// Recording duration in seconds
    pub duration_secs: u32,
    /// Number of memory-mapped capture buffers
    pub buffer_count: u32,
    /// Bounded wait for a capture buffer, in milliseconds
    pub poll_timeout_ms: u64,
    /// Target bitrate in bits per second
    pub bitrate: usize,
    /// Maximum consecutive B-frames
    pub max_b_frames: usize,
    /// x264 preset
    pub preset: String,
    /// x264 tune
    pub tune: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            output_path: PathBuf::from("webcam_video.mp4"),
            resolution: Resolution::VGA,
            fps: 25,
            duration_secs: 30,
            buffer_count: 4,
            poll_timeout_ms: 1000,
            bitrate: 2_000_000,
            max_b_frames: 1,
            preset: "fast".to_string(),
            tune: "zerolatency".to_string(),
        }
    }
}

impl RecorderConfig {
    /// Number of frames after which the recording completes
    pub fn target_frames(&self) -> u64 {
        self.duration_secs as u64 * self.fps as u64
    }

    /// Fixed pacing interval between loop iterations
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// One keyframe per second of output
    pub fn gop_size(&self) -> u32 {
        self.fps
    }

    /// Check values that would otherwise fail deep inside device or encoder setup
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(AppError::Config("fps must be greater than zero".into()));
        }
        if self.duration_secs == 0 {
            return Err(AppError::Config(
                "duration_secs must be greater than zero".into(),
            ));
        }
        if self.buffer_count == 0 {
            return Err(AppError::Config(
                "buffer_count must be greater than zero".into(),
            ));
        }
        if self.poll_timeout_ms == 0 || self.poll_timeout_ms > u16::MAX as u64 {
            return Err(AppError::Config(format!(
                "poll_timeout_ms must be between 1 and {}",
                u16::MAX
            )));
        }
        if !self.resolution.is_even() {
            return Err(AppError::Config(format!(
                "resolution {} must have non-zero even dimensions",
                self.resolution
            )));
        }
        if self.bitrate == 0 {
            return Err(AppError::Config("bitrate must be greater than zero".into()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(AppError::Config("output_path must not be empty".into()));
        }
        Ok(())
    }
}
