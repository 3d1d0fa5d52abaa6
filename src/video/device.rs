//! V4L2 device open, capability probe and format negotiation

use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use v4l::capability::Flags;
use v4l::format::FieldOrder;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Device capabilities relevant to streaming capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub video_capture: bool,
    pub streaming: bool,
}

impl DeviceCapabilities {
    fn from_flags(flags: Flags) -> Self {
        Self {
            video_capture: flags.contains(Flags::VIDEO_CAPTURE),
            streaming: flags.contains(Flags::STREAMING),
        }
    }

    /// Memory-mapped streaming capture needs both
    pub fn supports_streaming_capture(&self) -> bool {
        self.video_capture && self.streaming
    }
}

/// Format the driver actually agreed to
///
/// Authoritative for every later size computation, regardless of what was
/// requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per line reported by the driver
    pub stride: u32,
    /// Bytes per frame reported by the driver
    pub size: u32,
}

/// Open V4L2 capture device
///
/// The handle is opened non-blocking; readiness is waited for explicitly
/// before each dequeue. Closing happens when the value is dropped.
pub struct VideoDevice {
    pub path: PathBuf,
    device: Device,
}

impl VideoDevice {
    /// Open a video device and verify it can stream capture frames
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);

        let device = Device::with_path(&path).map_err(|e| {
            AppError::DeviceUnavailable(format!("Failed to open {:?}: {}", path, e))
        })?;

        let caps = device.query_caps().map_err(|e| {
            AppError::DeviceUnavailable(format!("Failed to query capabilities: {}", e))
        })?;
        let capabilities = DeviceCapabilities::from_flags(caps.capabilities);
        if !capabilities.supports_streaming_capture() {
            return Err(AppError::DeviceUnavailable(format!(
                "{:?} does not support streaming capture ({:?})",
                path, capabilities
            )));
        }

        info!("Webcam: {} ({})", caps.card, caps.driver);

        Ok(Self { path, device })
    }

    /// Request `format` at `resolution` and return what the driver negotiated
    pub fn negotiate_format(
        &self,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<NegotiatedFormat> {
        let mut fmt = Format::new(resolution.width, resolution.height, format.to_fourcc());
        fmt.field_order = FieldOrder::Interlaced;

        let actual = self.device.set_format(&fmt).map_err(|e| {
            AppError::DeviceUnavailable(format!("Failed to set format: {}", e))
        })?;

        let actual_format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            AppError::DeviceUnavailable(format!(
                "Driver substituted unsupported pixel format {}",
                actual.fourcc
            ))
        })?;
        if actual_format != format {
            return Err(AppError::DeviceUnavailable(format!(
                "Requested {}, driver negotiated {}",
                format, actual_format
            )));
        }

        let actual_resolution = Resolution::new(actual.width, actual.height);
        if actual_resolution != resolution {
            warn!("Requested {}, got {}", resolution, actual_resolution);
        }
        if !actual_resolution.is_even() {
            return Err(AppError::DeviceUnavailable(format!(
                "Negotiated resolution {} is not even",
                actual_resolution
            )));
        }

        info!("Resolution: {}", actual_resolution);

        Ok(NegotiatedFormat {
            resolution: actual_resolution,
            format: actual_format,
            stride: actual.stride,
            size: actual.size,
        })
    }

    /// Ask the driver for `fps` frames per second; drivers may ignore this
    pub fn request_frame_rate(&self, fps: u32) {
        match self.device.set_params(&Parameters::with_fps(fps)) {
            Ok(params) => debug!("Hardware frame interval: {}", params.interval),
            Err(e) => warn!("Failed to set hardware FPS: {}", e),
        }
    }

    /// Raw descriptor used by the buffer-exchange ioctls
    pub(crate) fn fd(&self) -> c_int {
        self.device.handle().fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_require_capture_and_streaming() {
        let both = DeviceCapabilities::from_flags(Flags::VIDEO_CAPTURE | Flags::STREAMING);
        assert!(both.supports_streaming_capture());

        let no_streaming = DeviceCapabilities::from_flags(Flags::VIDEO_CAPTURE | Flags::READ_WRITE);
        assert!(!no_streaming.supports_streaming_capture());

        let output_only = DeviceCapabilities::from_flags(Flags::VIDEO_OUTPUT | Flags::STREAMING);
        assert!(!output_only.supports_streaming_capture());
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let err = VideoDevice::open("/dev/this-video-device-does-not-exist").err();
        assert!(matches!(err, Some(AppError::DeviceUnavailable(_))));
    }
}
