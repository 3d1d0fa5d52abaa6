use thiserror::Error;

/// Recorder-wide error type
///
/// A poll timeout while waiting for a capture buffer is not represented here:
/// it is an expected outcome and surfaces as `Ok(None)` from
/// [`FrameSource::acquire`](crate::video::capture::FrameSource::acquire).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture buffer allocation failed: {0}")]
    BufferAllocationFailed(String),

    #[error("Failed to start capture stream: {0}")]
    StreamStartFailed(String),

    #[error("Failed to dequeue capture buffer: {0}")]
    DequeueFailed(String),

    #[error("Capture slot protocol violation: {0}")]
    SlotProtocol(String),

    #[error("Frame conversion failed: {0}")]
    FrameConvertFailed(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInitFailed(String),

    #[error("Failed to submit frame to encoder: {0}")]
    FrameSubmitFailed(String),

    #[error("Failed to write packet: {0}")]
    PacketWriteFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Whether this error happened while building the session (device or
    /// encoder setup) rather than during the capture loop
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AppError::DeviceUnavailable(_)
                | AppError::BufferAllocationFailed(_)
                | AppError::StreamStartFailed(_)
                | AppError::EncoderInitFailed(_)
                | AppError::Config(_)
        )
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
