//! V4L2 memory-mapped capture stream
//!
//! Buffer slots alternate between the driver ("queued") and the process
//! ("dequeued"). [`FrameSource::acquire`] hands out a [`SlotHandle`] for a
//! dequeued slot and [`FrameSource::release`] consumes it to queue the slot
//! again, so a slot can neither be released twice nor read after release.

use std::io;
use std::os::fd::BorrowedFd;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, trace, warn};
use v4l::buffer::Type as BufferType;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

use super::device::{NegotiatedFormat, VideoDevice};
use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Default number of capture buffers
const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Default bounded wait for a filled buffer
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture stream configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path
    pub device_path: PathBuf,
    /// Desired resolution
    pub resolution: Resolution,
    /// Desired frame rate (0 = leave the driver default)
    pub fps: u32,
    /// Number of capture buffers
    pub buffer_count: u32,
    /// Readiness wait before each dequeue
    pub timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            resolution: Resolution::VGA,
            fps: 25,
            buffer_count: DEFAULT_BUFFER_COUNT,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CaptureConfig {
    /// Create config for a specific device
    pub fn for_device(path: impl AsRef<Path>) -> Self {
        Self {
            device_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// Set frame rate
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set buffer count
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Set readiness timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Ownership state of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No process mapping
    Unmapped,
    /// Mapped, not yet handed to the driver
    Mapped,
    /// Owned by the driver, may be written at any time
    Queued,
    /// Owned by the process, contents stable
    Dequeued,
}

/// Bookkeeping for the slot ownership protocol
#[derive(Debug, Clone)]
pub struct SlotLedger {
    states: Vec<SlotState>,
}

impl SlotLedger {
    pub fn new(count: usize) -> Self {
        Self {
            states: vec![SlotState::Unmapped; count],
        }
    }

    /// Ledger whose slots are all mapped and not yet queued
    pub fn mapped(count: usize) -> Self {
        Self {
            states: vec![SlotState::Mapped; count],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.states.get(index).copied()
    }

    /// Slots currently owned by the driver
    pub fn queued(&self) -> usize {
        self.count(SlotState::Queued)
    }

    /// Slots currently held by the process
    pub fn held(&self) -> usize {
        self.count(SlotState::Dequeued)
    }

    /// First slot the driver owns, in index order
    pub fn first_queued(&self) -> Option<usize> {
        self.states.iter().position(|s| *s == SlotState::Queued)
    }

    fn count(&self, state: SlotState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    pub fn mark_mapped(&mut self, index: usize) -> Result<()> {
        self.transition(index, &[SlotState::Unmapped], SlotState::Mapped, "map")
    }

    /// Hand a slot to the driver (initial queueing or release)
    pub fn mark_queued(&mut self, index: usize) -> Result<()> {
        self.transition(
            index,
            &[SlotState::Mapped, SlotState::Dequeued],
            SlotState::Queued,
            "queue",
        )
    }

    pub fn mark_dequeued(&mut self, index: usize) -> Result<()> {
        self.transition(index, &[SlotState::Queued], SlotState::Dequeued, "dequeue")
    }

    /// After stream-off the driver gives every queued buffer back
    pub fn reclaim_all(&mut self) {
        for state in &mut self.states {
            if matches!(state, SlotState::Queued | SlotState::Dequeued) {
                *state = SlotState::Mapped;
            }
        }
    }

    pub fn mark_unmapped(&mut self, index: usize) {
        if let Some(state) = self.states.get_mut(index) {
            *state = SlotState::Unmapped;
        }
    }

    fn transition(
        &mut self,
        index: usize,
        from: &[SlotState],
        to: SlotState,
        action: &str,
    ) -> Result<()> {
        let state = self.states.get_mut(index).ok_or_else(|| {
            AppError::SlotProtocol(format!("cannot {} slot {}: out of range", action, index))
        })?;
        if !from.contains(state) {
            return Err(AppError::SlotProtocol(format!(
                "cannot {} slot {} while {:?}",
                action, index, state
            )));
        }
        *state = to;
        Ok(())
    }
}

/// Proof of ownership of one dequeued slot
///
/// Not `Clone`/`Copy`: releasing moves it back into the source.
#[derive(Debug)]
#[must_use = "a dequeued slot must be released or the driver runs out of buffers"]
pub struct SlotHandle {
    index: usize,
    bytes_used: usize,
    sequence: u32,
}

impl SlotHandle {
    pub(crate) fn new(index: usize, bytes_used: usize, sequence: u32) -> Self {
        Self {
            index,
            bytes_used,
            sequence,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes the driver wrote into the slot
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Driver frame sequence number
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Producer of raw YUYV frames using the slot protocol
pub trait FrameSource {
    /// Negotiated frame size
    fn resolution(&self) -> Resolution;

    /// Bytes per source row
    fn stride(&self) -> usize;

    /// Queue every slot and start streaming
    fn start(&mut self) -> Result<()>;

    /// Stop streaming; best effort, never fails
    fn stop(&mut self);

    /// Wait (bounded) for a filled slot. `Ok(None)` means no frame yet.
    fn acquire(&mut self) -> Result<Option<SlotHandle>>;

    /// Contents of a slot the caller currently holds
    fn frame(&self, slot: &SlotHandle) -> &[u8];

    /// Give a slot back to the producer
    fn release(&mut self, slot: SlotHandle) -> Result<()>;
}

/// One memory-mapped buffer slot
#[derive(Debug)]
struct MappedSlot {
    ptr: NonNull<u8>,
    length: usize,
}

impl MappedSlot {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/length come from a successful mmap that stays alive
        // until `unmap`, which consumes the slot.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.length) }
    }

    fn unmap(self) {
        // SAFETY: same region returned by mmap, unmapped exactly once.
        if let Err(e) = unsafe { v4l2::munmap(self.ptr.as_ptr() as *mut c_void, self.length) } {
            warn!("Failed to unmap capture buffer: {}", e);
        }
    }
}

/// V4L2 capture stream over a pool of memory-mapped buffers
pub struct CaptureStream {
    device: VideoDevice,
    negotiated: NegotiatedFormat,
    slots: Vec<MappedSlot>,
    ledger: SlotLedger,
    timeout: Duration,
    streaming: bool,
}

impl CaptureStream {
    /// Open the device, negotiate YUYV and map the buffer pool
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        info!(
            "Opening capture on {:?} at {} {}",
            config.device_path,
            config.resolution,
            PixelFormat::Yuyv
        );

        let device = VideoDevice::open(&config.device_path)?;
        let negotiated = device.negotiate_format(config.resolution, PixelFormat::Yuyv)?;
        if config.fps > 0 {
            device.request_frame_rate(config.fps);
        }

        let mut stream = Self {
            device,
            negotiated,
            slots: Vec::new(),
            ledger: SlotLedger::new(0),
            timeout: config.timeout,
            streaming: false,
        };
        // On failure `stream` drops here and unmaps whatever was mapped
        stream.allocate_buffers(config.buffer_count)?;

        info!(
            "Capture format: {} {} stride={} buffers={}",
            negotiated.resolution,
            negotiated.format,
            negotiated.stride,
            stream.slots.len()
        );
        Ok(stream)
    }

    fn allocate_buffers(&mut self, count: u32) -> Result<()> {
        let fd = self.device.fd();

        // SAFETY: plain-old-data bindgen struct, all-zero is a valid value
        let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
        req.count = count;
        req.type_ = BufferType::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        xioctl(fd, v4l2::vidioc::VIDIOC_REQBUFS, &mut req)
            .map_err(|e| AppError::BufferAllocationFailed(format!("VIDIOC_REQBUFS: {}", e)))?;

        if req.count == 0 {
            return Err(AppError::BufferAllocationFailed(
                "Driver returned zero capture buffers".to_string(),
            ));
        }
        if req.count != count {
            debug!("Requested {} buffers, driver granted {}", count, req.count);
        }

        self.ledger = SlotLedger::new(req.count as usize);
        for index in 0..req.count {
            let mut buf = new_buffer(index);
            xioctl(fd, v4l2::vidioc::VIDIOC_QUERYBUF, &mut buf).map_err(|e| {
                AppError::BufferAllocationFailed(format!("VIDIOC_QUERYBUF {}: {}", index, e))
            })?;

            let length = buf.length as usize;
            // SAFETY: `m.offset` is the active union member for MMAP buffers
            let offset = unsafe { buf.m.offset } as libc::off_t;
            // SAFETY: maps a driver-provided region of `length` bytes
            let ptr = unsafe {
                v4l2::mmap(
                    ptr::null_mut(),
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    offset,
                )
            }
            .map_err(|e| {
                AppError::BufferAllocationFailed(format!("mmap buffer {}: {}", index, e))
            })?;

            let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| {
                AppError::BufferAllocationFailed(format!("mmap buffer {} returned null", index))
            })?;
            self.slots.push(MappedSlot { ptr, length });
            self.ledger.mark_mapped(index as usize)?;
        }

        Ok(())
    }

    fn queue_buffer(&mut self, index: usize) -> io::Result<()> {
        let mut buf = new_buffer(index as u32);
        xioctl(self.device.fd(), v4l2::vidioc::VIDIOC_QBUF, &mut buf)
    }

    /// Wait for readiness. `false` on timeout.
    fn wait_ready(&self) -> Result<bool> {
        // SAFETY: the descriptor is owned by `self.device` and outlives the poll
        let fd = unsafe { BorrowedFd::borrow_raw(self.device.fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let timeout_ms = self.timeout.as_millis().min(u16::MAX as u128) as u16;

        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            // A signal (e.g. Ctrl+C) interrupting the wait counts as a timeout
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(AppError::DequeueFailed(format!("poll: {}", e))),
        }
    }

    /// Stop streaming, unmap every slot and release the driver's pool.
    ///
    /// Safe to call repeatedly and after a partial setup. The descriptor
    /// itself is closed when the stream is dropped.
    pub fn teardown(&mut self) {
        self.stop();

        let mapped = self.slots.len();
        for (index, slot) in self.slots.drain(..).enumerate() {
            slot.unmap();
            self.ledger.mark_unmapped(index);
        }

        if mapped > 0 {
            // SAFETY: zeroed request, count 0 frees the driver's buffers
            let mut req: v4l2_requestbuffers = unsafe { std::mem::zeroed() };
            req.count = 0;
            req.type_ = BufferType::VideoCapture as u32;
            req.memory = Memory::Mmap as u32;
            if let Err(e) = xioctl(self.device.fd(), v4l2::vidioc::VIDIOC_REQBUFS, &mut req) {
                debug!("Failed to free capture buffers: {}", e);
            }
            debug!("Released {} capture buffers", mapped);
        }
    }
}

impl FrameSource for CaptureStream {
    fn resolution(&self) -> Resolution {
        self.negotiated.resolution
    }

    fn stride(&self) -> usize {
        match self.negotiated.stride {
            0 => self.negotiated.resolution.width as usize * 2,
            stride => stride as usize,
        }
    }

    fn start(&mut self) -> Result<()> {
        for index in 0..self.slots.len() {
            self.queue_buffer(index).map_err(|e| {
                AppError::StreamStartFailed(format!("VIDIOC_QBUF {}: {}", index, e))
            })?;
            self.ledger.mark_queued(index)?;
        }

        let mut buf_type = BufferType::VideoCapture as u32;
        xioctl(self.device.fd(), v4l2::vidioc::VIDIOC_STREAMON, &mut buf_type)
            .map_err(|e| AppError::StreamStartFailed(format!("VIDIOC_STREAMON: {}", e)))?;
        self.streaming = true;

        info!("Capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        let mut buf_type = BufferType::VideoCapture as u32;
        if let Err(e) = xioctl(self.device.fd(), v4l2::vidioc::VIDIOC_STREAMOFF, &mut buf_type) {
            debug!("Failed to stop capture stream: {}", e);
        }
        self.streaming = false;
        self.ledger.reclaim_all();
        info!("Capture stopped");
    }

    fn acquire(&mut self) -> Result<Option<SlotHandle>> {
        if !self.streaming {
            return Err(AppError::DequeueFailed("stream is not running".to_string()));
        }
        if !self.wait_ready()? {
            return Ok(None);
        }

        let mut buf = new_buffer(0);
        match xioctl(self.device.fd(), v4l2::vidioc::VIDIOC_DQBUF, &mut buf) {
            Ok(()) => {}
            // Non-blocking descriptor: readiness raced with nothing to dequeue
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(AppError::DequeueFailed(format!("VIDIOC_DQBUF: {}", e))),
        }

        let index = buf.index as usize;
        self.ledger.mark_dequeued(index)?;
        trace!(slot = index, sequence = buf.sequence, bytes = buf.bytesused, "Dequeued");

        Ok(Some(SlotHandle::new(
            index,
            buf.bytesused as usize,
            buf.sequence,
        )))
    }

    fn frame(&self, slot: &SlotHandle) -> &[u8] {
        let data = self.slots[slot.index].as_slice();
        &data[..slot.bytes_used.min(data.len())]
    }

    fn release(&mut self, slot: SlotHandle) -> Result<()> {
        if self.ledger.state(slot.index) != Some(SlotState::Dequeued) {
            return Err(AppError::SlotProtocol(format!(
                "slot {} is not held by the process",
                slot.index
            )));
        }
        self.queue_buffer(slot.index).map_err(|e| {
            AppError::DequeueFailed(format!("VIDIOC_QBUF {}: {}", slot.index, e))
        })?;
        self.ledger.mark_queued(slot.index)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn new_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: plain-old-data bindgen struct, all-zero is a valid value
    let mut buf: v4l2_buffer = unsafe { std::mem::zeroed() };
    buf.type_ = BufferType::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf.index = index;
    buf
}

fn xioctl<T>(fd: c_int, request: v4l2::vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    // SAFETY: `arg` is the struct type the request expects and lives for the call
    unsafe { v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) }
}
