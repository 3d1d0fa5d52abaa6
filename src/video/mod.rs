//! Video capture, pixel conversion and encoding
//!
//! V4L2 memory-mapped capture of YUYV frames, conversion to planar YUV420P
//! and H.264 encoding into a container file.

pub mod capture;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod synthetic;

pub use capture::{CaptureConfig, CaptureStream, FrameSource, SlotHandle, SlotLedger, SlotState};
pub use convert::{PixelConverter, PlanarTarget, Yuv420pBuffer};
pub use device::{NegotiatedFormat, VideoDevice};
pub use encoder::{CoderState, EncoderConfig, FrameSink, H264FileEncoder};
pub use format::{PixelFormat, Resolution};
pub use synthetic::{TestPatternSource, YuvColour};
