//! Recording session orchestration
//!
//! Configure device, configure coder, start streaming, then loop until the
//! target frame count is reached, cancellation is requested, or a hard error
//! occurs. Whatever ends the loop, streaming is stopped and the coder is
//! drained and finalized so a partial recording is still a valid file.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::video::capture::{CaptureConfig, CaptureStream, FrameSource, SlotHandle};
use crate::video::convert::PixelConverter;
use crate::video::encoder::{EncoderConfig, FrameSink, H264FileEncoder};
use crate::warn_throttled;

const TIMEOUT_LOG_KEY: &str = "capture_timeout";

/// Cooperative stop request shared with an interrupt handler
///
/// The handler side only ever calls [`CancelFlag::cancel`]; the recording
/// loop checks the flag once per iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the capture loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Target frame count reached
    Completed,
    Cancelled,
    /// Hard error inside the loop or while finalizing
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => write!(f, "completed"),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of one recording session
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// Slots dequeued from the source
    pub frames_captured: u64,
    /// Frames accepted by the encoder
    pub frames_encoded: u64,
    pub packets_written: u64,
    /// Bounded waits that expired without a frame
    pub timeouts: u64,
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

impl RecordingSummary {
    /// Encoded frames per wall-clock second
    pub fn average_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_encoded as f64 / secs
        } else {
            0.0
        }
    }

    /// Recording seconds covered by the encoded frames at `fps`
    pub fn recorded_secs(&self, fps: u32) -> f64 {
        if fps == 0 {
            return 0.0;
        }
        self.frames_encoded as f64 / fps as f64
    }
}

/// Loop parameters derived from the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPlan {
    pub target_frames: u64,
    pub fps: u32,
    /// Fixed sleep between iterations, no drift correction
    pub frame_interval: Duration,
    pub progress_interval: Duration,
}

impl SessionPlan {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            target_frames: config.target_frames(),
            fps: config.fps,
            frame_interval: config.frame_interval(),
            progress_interval: Duration::from_secs(1),
        }
    }

    /// Replace the pacing sleep
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }
}

/// Record from the configured V4L2 device into the configured file
///
/// Setup failures (device, buffers, encoder, stream start) are returned as
/// errors. Once streaming has started the session always yields a summary.
pub fn record(config: &RecorderConfig, cancel: &CancelFlag) -> Result<RecordingSummary> {
    config.validate()?;

    let capture_config = CaptureConfig::for_device(&config.device_path)
        .with_resolution(config.resolution.width, config.resolution.height)
        .with_fps(config.fps)
        .with_buffer_count(config.buffer_count)
        .with_timeout(config.poll_timeout());
    let mut stream = CaptureStream::open(&capture_config)?;

    record_from(&mut stream, config, cancel)
}

/// Record from an already configured frame source
///
/// The coder is sized from the source's negotiated resolution, not from the
/// requested one.
pub fn record_from<S: FrameSource>(
    source: &mut S,
    config: &RecorderConfig,
    cancel: &CancelFlag,
) -> Result<RecordingSummary> {
    let encoder_config = EncoderConfig::from_recorder(config, source.resolution());
    let mut encoder = H264FileEncoder::create(&encoder_config)?;

    if let Err(e) = source.start() {
        encoder.close();
        return Err(e);
    }

    let plan = SessionPlan::from_config(config);
    Ok(run_session(source, &mut encoder, &plan, cancel))
}

/// Drive a started source into a sink until done, cancelled or failed
///
/// Always stops the source and finalizes the sink before returning.
pub fn run_session<S, K>(
    source: &mut S,
    sink: &mut K,
    plan: &SessionPlan,
    cancel: &CancelFlag,
) -> RecordingSummary
where
    S: FrameSource,
    K: FrameSink,
{
    let converter =
        PixelConverter::yuyv_to_yuv420p(source.resolution()).with_src_stride(source.stride());
    let mut throttler = LogThrottler::with_secs(5);

    let started = Instant::now();
    let mut last_progress = started;
    let mut frames_captured = 0u64;
    let mut timeouts = 0u64;

    debug!(
        "Capture loop: target {} frames, interval {:?}",
        plan.target_frames, plan.frame_interval
    );

    let loop_reason = loop {
        if cancel.is_cancelled() {
            info!("Cancellation requested, stopping");
            break StopReason::Cancelled;
        }
        if sink.frames_submitted() >= plan.target_frames {
            break StopReason::Completed;
        }

        match source.acquire() {
            Ok(Some(slot)) => {
                frames_captured += 1;
                let missed = throttler.take_suppressed(TIMEOUT_LOG_KEY);
                if missed > 0 {
                    debug!("Capture resumed, {} more timeouts were not logged", missed);
                }
                if let Err(e) = encode_slot(source, sink, &converter, slot) {
                    error!("Recording stopped: {}", e);
                    break StopReason::Failed(e.to_string());
                }
            }
            Ok(None) => {
                timeouts += 1;
                warn_throttled!(
                    throttler,
                    TIMEOUT_LOG_KEY,
                    "Timed out waiting for a frame ({} timeouts so far)",
                    timeouts
                );
            }
            Err(e) => {
                error!("Recording stopped: {}", e);
                break StopReason::Failed(e.to_string());
            }
        }

        if last_progress.elapsed() >= plan.progress_interval {
            last_progress = Instant::now();
            let frames = sink.frames_submitted();
            info!(
                "Recorded {}/{} seconds ({} frames)",
                frames / plan.fps.max(1) as u64,
                plan.target_frames / plan.fps.max(1) as u64,
                frames
            );
        }

        if !plan.frame_interval.is_zero() {
            thread::sleep(plan.frame_interval);
        }
    };

    source.stop();

    let stop_reason = match (sink.finish(), loop_reason) {
        (Err(e), StopReason::Failed(reason)) => {
            warn!("Finalization also failed: {}", e);
            StopReason::Failed(reason)
        }
        (Err(e), _) => {
            error!("Failed to finalize recording: {}", e);
            StopReason::Failed(e.to_string())
        }
        (Ok(()), reason) => reason,
    };

    RecordingSummary {
        frames_captured,
        frames_encoded: sink.frames_submitted(),
        packets_written: sink.packets_written(),
        timeouts,
        elapsed: started.elapsed(),
        stop_reason,
    }
}

/// Convert and submit one dequeued slot, then give it back to the source
///
/// The slot is released on every path, including conversion and encode
/// failures.
fn encode_slot<S, K>(
    source: &mut S,
    sink: &mut K,
    converter: &PixelConverter,
    slot: SlotHandle,
) -> Result<i64>
where
    S: FrameSource,
    K: FrameSink,
{
    let submitted = {
        let data = source.frame(&slot);
        sink.submit(|target| converter.convert(data, target))
    };
    let released = source.release(slot);

    let pts = submitted?;
    released?;
    Ok(pts)
}
