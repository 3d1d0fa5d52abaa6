//! In-process test pattern source
//!
//! Behaves like a capture device that fills its buffers with a solid YUYV
//! colour. Slots go through the same [`SlotLedger`] protocol as the V4L2
//! stream, so the recorder can run end to end without hardware.

use tracing::{debug, info};

use super::capture::{FrameSource, SlotHandle, SlotLedger, SlotState};
use super::convert::{fill_yuyv, yuyv_buffer_size};
use super::format::Resolution;
use crate::error::{AppError, Result};

/// Solid colour in YUV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvColour {
    pub y: u8,
    pub u: u8,
    pub v: u8,
}

impl YuvColour {
    pub const GREY: YuvColour = YuvColour {
        y: 128,
        u: 128,
        v: 128,
    };
    /// BT.601 limited-range blue
    pub const BLUE: YuvColour = YuvColour {
        y: 41,
        u: 240,
        v: 110,
    };
}

/// Synthetic YUYV frame source
pub struct TestPatternSource {
    resolution: Resolution,
    colour: YuvColour,
    slots: Vec<Vec<u8>>,
    ledger: SlotLedger,
    streaming: bool,
    /// Timeouts to report before the first frame
    leading_timeouts: u32,
    /// Report a dequeue failure after this many frames
    fail_after: Option<u64>,
    produced: u64,
}

impl TestPatternSource {
    pub fn new(resolution: Resolution, buffer_count: usize) -> Self {
        let frame_len = yuyv_buffer_size(resolution);
        Self {
            resolution,
            colour: YuvColour::GREY,
            slots: vec![vec![0u8; frame_len]; buffer_count],
            ledger: SlotLedger::mapped(buffer_count),
            streaming: false,
            leading_timeouts: 0,
            fail_after: None,
            produced: 0,
        }
    }

    pub fn with_colour(mut self, colour: YuvColour) -> Self {
        self.colour = colour;
        self
    }

    /// Report `count` poll timeouts before producing the first frame
    pub fn with_leading_timeouts(mut self, count: u32) -> Self {
        self.leading_timeouts = count;
        self
    }

    /// Fail with `DequeueFailed` once `frames` frames have been produced
    pub fn with_failure_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    /// Frames handed out so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}

impl FrameSource for TestPatternSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn stride(&self) -> usize {
        self.resolution.width as usize * 2
    }

    fn start(&mut self) -> Result<()> {
        if self.ledger.is_empty() {
            return Err(AppError::StreamStartFailed(
                "test pattern has no buffers".to_string(),
            ));
        }
        for index in 0..self.ledger.len() {
            self.ledger.mark_queued(index)?;
        }
        self.streaming = true;
        info!(
            "Test pattern started: {} colour {:?}",
            self.resolution, self.colour
        );
        Ok(())
    }

    fn stop(&mut self) {
        if self.streaming {
            self.streaming = false;
            self.ledger.reclaim_all();
            debug!("Test pattern stopped after {} frames", self.produced);
        }
    }

    fn acquire(&mut self) -> Result<Option<SlotHandle>> {
        if !self.streaming {
            return Err(AppError::DequeueFailed("stream is not running".to_string()));
        }
        if self.leading_timeouts > 0 {
            self.leading_timeouts -= 1;
            return Ok(None);
        }
        if self.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(AppError::DequeueFailed(format!(
                "test pattern failure after {} frames",
                self.produced
            )));
        }

        // Every buffer held by the caller: the "driver" has nothing to fill
        let Some(index) = self.ledger.first_queued() else {
            return Ok(None);
        };

        let YuvColour { y, u, v } = self.colour;
        fill_yuyv(&mut self.slots[index], y, u, v);
        self.ledger.mark_dequeued(index)?;
        let sequence = self.produced as u32;
        self.produced += 1;

        Ok(Some(SlotHandle::new(index, self.slots[index].len(), sequence)))
    }

    fn frame(&self, slot: &SlotHandle) -> &[u8] {
        &self.slots[slot.index()][..slot.bytes_used()]
    }

    fn release(&mut self, slot: SlotHandle) -> Result<()> {
        if self.ledger.state(slot.index()) != Some(SlotState::Dequeued) {
            return Err(AppError::SlotProtocol(format!(
                "slot {} is not held by the process",
                slot.index()
            )));
        }
        self.ledger.mark_queued(slot.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_source_slots_start_mapped() {
        let mut source = TestPatternSource::new(Resolution::new(4, 2), 3);
        assert_eq!(source.ledger().len(), 3);
        assert_eq!(source.ledger().state(2), Some(SlotState::Mapped));

        source.start().unwrap();
        assert_eq!(source.ledger().queued(), 3);
    }

    #[test]
    fn test_acquire_requires_start() {
        let mut source = TestPatternSource::new(Resolution::new(4, 2), 2);
        assert!(matches!(source.acquire(), Err(AppError::DequeueFailed(_))));
    }

    #[test]
    fn test_frames_are_solid_colour() {
        let mut source =
            TestPatternSource::new(Resolution::new(4, 2), 2).with_colour(YuvColour::BLUE);
        source.start().unwrap();

        let slot = source.acquire().unwrap().unwrap();
        assert_eq!(source.frame(&slot), &[41u8, 240, 41, 110].repeat(4)[..]);
        source.release(slot).unwrap();
    }

    #[test]
    fn test_pool_exhaustion_behaves_like_timeout() {
        let mut source = TestPatternSource::new(Resolution::new(4, 2), 2);
        source.start().unwrap();

        let a = source.acquire().unwrap().unwrap();
        let b = source.acquire().unwrap().unwrap();
        assert_ne!(a.index(), b.index());
        assert!(source.acquire().unwrap().is_none());
        assert_eq!(source.ledger().held(), 2);

        source.release(a).unwrap();
        let c = source.acquire().unwrap().unwrap();
        assert_eq!(source.ledger().held() + source.ledger().queued(), 2);

        source.release(b).unwrap();
        source.release(c).unwrap();
        assert_eq!(source.ledger().queued(), 2);
    }

    #[test]
    fn test_leading_timeouts_then_failure() {
        let mut source = TestPatternSource::new(Resolution::new(4, 2), 2)
            .with_leading_timeouts(2)
            .with_failure_after(1);
        source.start().unwrap();

        assert!(source.acquire().unwrap().is_none());
        assert!(source.acquire().unwrap().is_none());
        let slot = source.acquire().unwrap().unwrap();
        assert_eq!(slot.sequence(), 0);
        source.release(slot).unwrap();
        assert!(matches!(source.acquire(), Err(AppError::DequeueFailed(_))));
    }

    #[test]
    fn test_stop_reclaims_held_slots() {
        let mut source = TestPatternSource::new(Resolution::new(4, 2), 3);
        source.start().unwrap();
        let _held = source.acquire().unwrap().unwrap();
        source.stop();
        assert!(!source.is_streaming());
        assert_eq!(source.ledger().held(), 0);
        assert_eq!(source.ledger().queued(), 0);
    }
}
