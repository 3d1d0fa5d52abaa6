//! H.264 encoder writing into a container file through FFmpeg
//!
//! The encoder is FFmpeg's default H.264 implementation (libx264 on most
//! builds). Frames are YUV420P at the negotiated capture resolution and are
//! timestamped in units of `1/fps`; packets are rescaled to the stream time
//! base chosen by the muxer before interleaved writing.

use std::sync::OnceLock;
use tracing::{debug, info, warn};

use ffmpeg_next as ffmpeg;
use ffmpeg::codec;
use ffmpeg::format::{self, Pixel};
use ffmpeg::util::frame;
use ffmpeg::{encoder, Dictionary, Packet, Rational};

use super::{CoderState, EncoderConfig, FrameSink, PtsCounter};
use crate::error::{AppError, Result};
use crate::video::convert::{PlanarTarget, Plane};

static FFMPEG_INIT: OnceLock<std::result::Result<(), ffmpeg::Error>> = OnceLock::new();

/// Initialize FFmpeg (only once) and quiet its logging
fn init_ffmpeg() -> Result<()> {
    FFMPEG_INIT
        .get_or_init(|| {
            ffmpeg::init()?;
            ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
            debug!("FFmpeg initialized");
            Ok(())
        })
        .as_ref()
        .map(|_| ())
        .map_err(|e| AppError::EncoderInitFailed(format!("FFmpeg init failed: {}", e)))
}

/// Whether this FFmpeg build can encode H.264 at all
pub fn h264_available() -> bool {
    init_ffmpeg().is_ok() && encoder::find(codec::Id::H264).is_some()
}

impl PlanarTarget for frame::Video {
    fn plane_mut(&mut self, plane: Plane) -> (&mut [u8], usize) {
        let index = plane.index();
        let stride = self.stride(index);
        (self.data_mut(index), stride)
    }
}

/// H.264 encoder bound to one output file
///
/// Construction performs the whole setup sequence: container context and
/// file, codec configuration, stream, and header. The value is therefore
/// always at least in [`CoderState::HeaderWritten`] when handed out.
pub struct H264FileEncoder {
    config: EncoderConfig,
    state: CoderState,
    output: Option<format::context::Output>,
    encoder: Option<encoder::video::Encoder>,
    /// Reusable picture the converter writes into
    picture: frame::Video,
    packet: Packet,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    pts: PtsCounter,
    packets_written: u64,
    keyframes: u64,
}

impl H264FileEncoder {
    /// Create the output file and bring the coder up to `HeaderWritten`
    pub fn create(config: &EncoderConfig) -> Result<Self> {
        init_ffmpeg()?;

        let resolution = config.resolution;
        if !resolution.is_even() {
            return Err(AppError::EncoderInitFailed(format!(
                "H.264 needs even dimensions, got {}",
                resolution
            )));
        }
        if config.fps == 0 {
            return Err(AppError::EncoderInitFailed("fps must be non-zero".into()));
        }

        let mut output = format::output(&config.output_path).map_err(|e| {
            AppError::EncoderInitFailed(format!(
                "Failed to create {:?}: {}",
                config.output_path, e
            ))
        })?;
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let codec = encoder::find(codec::Id::H264).ok_or_else(|| {
            AppError::EncoderInitFailed("No H.264 encoder in this FFmpeg build".into())
        })?;

        let mut video = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| {
                AppError::EncoderInitFailed(format!("Failed to create encoder context: {}", e))
            })?;

        let time_base = Rational::new(1, config.fps as i32);
        video.set_width(resolution.width);
        video.set_height(resolution.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(Rational::new(config.fps as i32, 1)));
        video.set_bit_rate(config.bitrate);
        video.set_gop(config.gop_size);
        video.set_max_b_frames(config.max_b_frames);
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", &config.preset);
        opts.set("tune", &config.tune);

        let opened = video.open_with(opts).map_err(|e| {
            AppError::EncoderInitFailed(format!(
                "Failed to open encoder '{}': {}",
                codec.name(),
                e
            ))
        })?;
        debug!("Coder {}: {}", CoderState::Configured, codec.name());

        let stream_index = {
            let mut stream = output.add_stream(codec).map_err(|e| {
                AppError::EncoderInitFailed(format!("Failed to add stream: {}", e))
            })?;
            stream.set_parameters(&opened);
            stream.set_time_base(time_base);
            stream.index()
        };

        output.write_header().map_err(|e| {
            AppError::EncoderInitFailed(format!("Failed to write container header: {}", e))
        })?;

        // The muxer may pick its own time base while writing the header
        let stream_time_base = output
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .unwrap_or(time_base);

        info!(
            "Encoder initialized: {} {} @ {} fps, {} bps, gop {}, time_base encoder={} stream={}",
            codec.name(),
            resolution,
            config.fps,
            config.bitrate,
            config.gop_size,
            time_base,
            stream_time_base
        );

        Ok(Self {
            config: config.clone(),
            state: CoderState::HeaderWritten,
            output: Some(output),
            encoder: Some(opened),
            picture: frame::Video::new(Pixel::YUV420P, resolution.width, resolution.height),
            packet: Packet::empty(),
            stream_index,
            encoder_time_base: time_base,
            stream_time_base,
            pts: PtsCounter::new(),
            packets_written: 0,
            keyframes: 0,
        })
    }

    pub fn state(&self) -> CoderState {
        self.state
    }

    /// Keyframe packets written so far
    pub fn keyframes(&self) -> u64 {
        self.keyframes
    }

    /// Release the coder and the container without finalizing
    ///
    /// Safe from any state and safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == CoderState::Closed {
            return;
        }
        self.encoder = None;
        self.output = None;
        debug!("Coder {} -> {}", self.state, CoderState::Closed);
        self.state = CoderState::Closed;
    }

    /// Move every packet the encoder has ready into the container
    ///
    /// Returns `true` once the encoder reports end of stream.
    fn write_pending_packets(&mut self) -> Result<bool> {
        let (Some(encoder), Some(output)) = (self.encoder.as_mut(), self.output.as_mut()) else {
            return Err(AppError::PacketWriteFailed("encoder is closed".into()));
        };

        loop {
            match encoder.receive_packet(&mut self.packet) {
                Ok(()) => {
                    self.packet.set_stream(self.stream_index);
                    self.packet.set_duration(1);
                    self.packet
                        .rescale_ts(self.encoder_time_base, self.stream_time_base);
                    if self.packet.is_key() {
                        self.keyframes += 1;
                    }
                    self.packet.write_interleaved(output).map_err(|e| {
                        AppError::PacketWriteFailed(format!("Failed to write packet: {}", e))
                    })?;
                    self.packets_written += 1;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == libc::EAGAIN => return Ok(false),
                Err(ffmpeg::Error::Eof) => return Ok(true),
                Err(e) => {
                    return Err(AppError::PacketWriteFailed(format!(
                        "Failed to receive packet: {}",
                        e
                    )))
                }
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AppError::PacketWriteFailed("encoder is closed".into()))?;
        encoder.send_eof().map_err(|e| {
            AppError::FrameSubmitFailed(format!("Failed to signal end of stream: {}", e))
        })?;

        if self.write_pending_packets()? {
            debug!("Encoder drained");
            Ok(())
        } else {
            Err(AppError::PacketWriteFailed(
                "encoder asked for more input after end of stream".into(),
            ))
        }
    }

    fn write_trailer(&mut self) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| AppError::PacketWriteFailed("container is closed".into()))?;
        output.write_trailer().map_err(|e| {
            AppError::PacketWriteFailed(format!("Failed to write container trailer: {}", e))
        })?;
        self.state = CoderState::TrailerWritten;
        Ok(())
    }
}

impl FrameSink for H264FileEncoder {
    fn submit<F>(&mut self, fill: F) -> Result<i64>
    where
        F: FnOnce(&mut dyn PlanarTarget) -> Result<()>,
    {
        if !self.state.accepts_frames() {
            return Err(AppError::FrameSubmitFailed(format!(
                "encoder is {}",
                self.state
            )));
        }

        // The encoder may still reference the previous picture's buffers
        // SAFETY: `picture` owns a valid AVFrame allocated by `frame::Video::new`
        // and nothing else holds a Rust reference into its planes here
        let ret = unsafe { ffmpeg::ffi::av_frame_make_writable(self.picture.as_mut_ptr()) };
        if ret < 0 {
            return Err(AppError::FrameSubmitFailed(format!(
                "Picture is not writable: {}",
                ffmpeg::Error::from(ret)
            )));
        }

        fill(&mut self.picture)?;

        let pts = self.pts.peek();
        self.picture.set_pts(Some(pts));

        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AppError::FrameSubmitFailed("encoder is closed".into()))?;
        encoder.send_frame(&self.picture).map_err(|e| {
            AppError::FrameSubmitFailed(format!("Failed to send frame {}: {}", pts, e))
        })?;
        self.pts.next();
        self.state = CoderState::Encoding;

        self.write_pending_packets()?;
        Ok(pts)
    }

    fn finish(&mut self) -> Result<()> {
        if self.state.is_finished() {
            return Ok(());
        }

        self.state = CoderState::Draining;
        let drained = self.drain();
        if let Err(e) = &drained {
            warn!("Drain failed, finalizing container anyway: {}", e);
        }
        let trailer = self.write_trailer();
        if trailer.is_err() {
            self.close();
        }

        info!(
            "Container finalized: {:?} ({} frames, {} packets, {} keyframes)",
            self.config.output_path,
            self.pts.issued(),
            self.packets_written,
            self.keyframes
        );
        drained.and(trailer)
    }

    fn frames_submitted(&self) -> u64 {
        self.pts.issued()
    }

    fn packets_written(&self) -> u64 {
        self.packets_written
    }
}

impl Drop for H264FileEncoder {
    fn drop(&mut self) {
        if !self.state.is_finished() {
            warn!(
                "Encoder for {:?} dropped while {}, container left unfinalized",
                self.config.output_path, self.state
            );
        }
        self.close();
    }
}
