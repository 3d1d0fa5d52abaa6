//! H.264 encoding and container output
//!
//! The recorder talks to the encoder through [`FrameSink`]; [`H264FileEncoder`]
//! is the FFmpeg-backed implementation writing a single-stream container file.

pub mod h264;

use std::fmt;
use std::path::PathBuf;

use crate::config::RecorderConfig;
use crate::error::Result;
use crate::video::convert::PlanarTarget;
use crate::video::format::Resolution;

pub use h264::{h264_available, H264FileEncoder};

/// Encoder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Output container file; the muxer is picked from the extension
    pub output_path: PathBuf,
    /// Frame size, always the negotiated capture resolution
    pub resolution: Resolution,
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: usize,
    /// Keyframe interval in frames
    pub gop_size: u32,
    pub max_b_frames: usize,
    pub preset: String,
    pub tune: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::from_recorder(&RecorderConfig::default(), Resolution::VGA)
    }
}

impl EncoderConfig {
    /// Encoder settings for a session whose capture negotiated `resolution`
    pub fn from_recorder(config: &RecorderConfig, resolution: Resolution) -> Self {
        Self {
            output_path: config.output_path.clone(),
            resolution,
            fps: config.fps,
            bitrate: config.bitrate,
            gop_size: config.gop_size(),
            max_b_frames: config.max_b_frames,
            preset: config.preset.clone(),
            tune: config.tune.clone(),
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self.gop_size = fps;
        self
    }
}

/// Lifecycle of the coder and its container
///
/// ```text
/// Unconfigured -> Configured -> HeaderWritten -> Encoding -> Draining -> TrailerWritten -> Closed
/// ```
///
/// Any state may jump to `Closed` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoderState {
    Unconfigured,
    /// Codec opened and stream added
    Configured,
    HeaderWritten,
    /// At least one frame submitted
    Encoding,
    /// End of stream signalled, remaining packets being collected
    Draining,
    TrailerWritten,
    Closed,
}

impl CoderState {
    /// Frames may only be submitted between header and drain
    pub fn accepts_frames(&self) -> bool {
        matches!(self, CoderState::HeaderWritten | CoderState::Encoding)
    }

    /// Finalization has already happened or can no longer happen
    pub fn is_finished(&self) -> bool {
        matches!(self, CoderState::TrailerWritten | CoderState::Closed)
    }
}

impl fmt::Display for CoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoderState::Unconfigured => "unconfigured",
            CoderState::Configured => "configured",
            CoderState::HeaderWritten => "header written",
            CoderState::Encoding => "encoding",
            CoderState::Draining => "draining",
            CoderState::TrailerWritten => "trailer written",
            CoderState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Presentation timestamps in units of one frame period
///
/// Starts at zero and advances only for frames that actually reach the
/// encoder, so capture timeouts never leave gaps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PtsCounter {
    next: i64,
}

impl PtsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next timestamp
    pub fn next(&mut self) -> i64 {
        let pts = self.next;
        self.next += 1;
        pts
    }

    /// Timestamp the next frame will get, without consuming it
    pub fn peek(&self) -> i64 {
        self.next
    }

    /// Number of timestamps issued so far
    pub fn issued(&self) -> u64 {
        self.next as u64
    }
}

/// Consumer of planar 4:2:0 frames
pub trait FrameSink {
    /// Let `fill` write the next frame into the sink's picture, then encode it
    ///
    /// Returns the presentation timestamp assigned to the frame. When `fill`
    /// fails, nothing is submitted and no timestamp is consumed.
    fn submit<F>(&mut self, fill: F) -> Result<i64>
    where
        F: FnOnce(&mut dyn PlanarTarget) -> Result<()>;

    /// Flush pending output and finalize the container
    ///
    /// Calling it again after it has completed is a no-op.
    fn finish(&mut self) -> Result<()>;

    /// Frames accepted by the encoder
    fn frames_submitted(&self) -> u64;

    /// Compressed packets written to the container
    fn packets_written(&self) -> u64;
}
