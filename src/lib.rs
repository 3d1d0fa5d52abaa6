//! webcam-recorder - record a V4L2 webcam into an H.264 video file
//!
//! Frames are captured through memory-mapped V4L2 buffers, converted from
//! YUYV to YUV420P and encoded with FFmpeg for a fixed duration. Recording
//! stops early on cancellation and the output file is always finalized.

pub mod config;
pub mod error;
pub mod recorder;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
