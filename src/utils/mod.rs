//! Utility modules

pub mod throttle;

pub use throttle::LogThrottler;
