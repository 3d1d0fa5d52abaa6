//! End-to-end recordings from the synthetic source into real container files

use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg::{Rational, Rescale};

use webcam_recorder::config::RecorderConfig;
use webcam_recorder::recorder::{self, run_session, CancelFlag, SessionPlan, StopReason};
use webcam_recorder::video::encoder::h264_available;
use webcam_recorder::video::{
    EncoderConfig, FrameSink, FrameSource, H264FileEncoder, Resolution, SlotHandle,
    TestPatternSource, YuvColour,
};
use webcam_recorder::Result;

/// What a standard demuxer and decoder recover from a recording
struct Playback {
    /// Packet timestamps in frame units, in file order
    pts: Vec<i64>,
    first_is_key: bool,
    decoded_frames: usize,
    /// Luma sample at the centre of the last decoded frame
    centre_luma: Option<u8>,
}

fn play_back(path: &Path, fps: i32) -> Playback {
    let mut input = ffmpeg::format::input(&path).unwrap();
    let stream = input.streams().best(ffmpeg::media::Type::Video).unwrap();
    let index = stream.index();
    let time_base = stream.time_base();

    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters()).unwrap();
    let mut decoder = context.decoder().video().unwrap();
    let mut frame = ffmpeg::util::frame::Video::empty();

    let mut playback = Playback {
        pts: Vec::new(),
        first_is_key: false,
        decoded_frames: 0,
        centre_luma: None,
    };

    let mut collect = |decoder: &mut ffmpeg::decoder::Video, playback: &mut Playback| {
        while decoder.receive_frame(&mut frame).is_ok() {
            playback.decoded_frames += 1;
            let x = frame.width() as usize / 2;
            let y = frame.height() as usize / 2;
            playback.centre_luma = Some(frame.data(0)[y * frame.stride(0) + x]);
        }
    };

    for (stream, packet) in input.packets() {
        if stream.index() != index {
            continue;
        }
        if playback.pts.is_empty() {
            playback.first_is_key = packet.is_key();
        }
        let pts = packet.pts().unwrap();
        playback.pts.push(pts.rescale(time_base, Rational::new(1, fps)));

        decoder.send_packet(&packet).unwrap();
        collect(&mut decoder, &mut playback);
    }
    decoder.send_eof().unwrap();
    collect(&mut decoder, &mut playback);

    playback
}

/// Source that raises the cancel flag once it has produced `after` frames
struct CancellingSource {
    inner: TestPatternSource,
    cancel: CancelFlag,
    after: u64,
}

impl FrameSource for CancellingSource {
    fn resolution(&self) -> Resolution {
        self.inner.resolution()
    }

    fn stride(&self) -> usize {
        self.inner.stride()
    }

    fn start(&mut self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&mut self) {
        self.inner.stop()
    }

    fn acquire(&mut self) -> Result<Option<SlotHandle>> {
        let slot = self.inner.acquire()?;
        if self.inner.produced() >= self.after {
            self.cancel.cancel();
        }
        Ok(slot)
    }

    fn frame(&self, slot: &SlotHandle) -> &[u8] {
        self.inner.frame(slot)
    }

    fn release(&mut self, slot: SlotHandle) -> Result<()> {
        self.inner.release(slot)
    }
}

#[test]
fn test_two_seconds_of_vga_at_25_fps() {
    if !h264_available() {
        eprintln!("skipping: no H.264 encoder");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        output_path: dir.path().join("webcam_video.mp4"),
        resolution: Resolution::VGA,
        fps: 25,
        duration_secs: 2,
        ..Default::default()
    };

    let mut source = TestPatternSource::new(config.resolution, 4)
        .with_colour(YuvColour::BLUE)
        .with_leading_timeouts(3);
    let mut encoder =
        H264FileEncoder::create(&EncoderConfig::from_recorder(&config, source.resolution()))
            .unwrap();
    source.start().unwrap();

    let plan = SessionPlan::from_config(&config).with_frame_interval(Duration::ZERO);
    let summary = run_session(&mut source, &mut encoder, &plan, &CancelFlag::new());

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.frames_encoded, 50);
    assert_eq!(summary.timeouts, 3);
    assert_eq!(encoder.packets_written(), 50);
    drop(encoder);

    let playback = play_back(&config.output_path, 25);
    assert_eq!(playback.pts.len(), 50);
    assert!(playback.first_is_key);
    let mut pts = playback.pts.clone();
    pts.sort_unstable();
    assert_eq!(pts, (0..50).collect::<Vec<i64>>());
    assert_eq!(playback.decoded_frames, 50);

    let luma = playback.centre_luma.unwrap();
    assert!((luma as i32 - YuvColour::BLUE.y as i32).abs() <= 10, "luma {}", luma);
}

#[test]
fn test_cancelled_recording_is_still_playable() {
    if !h264_available() {
        eprintln!("skipping: no H.264 encoder");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        output_path: dir.path().join("partial.mp4"),
        resolution: Resolution::new(160, 120),
        fps: 25,
        duration_secs: 4,
        ..Default::default()
    };

    let cancel = CancelFlag::new();
    let mut source = CancellingSource {
        inner: TestPatternSource::new(config.resolution, 4),
        cancel: cancel.clone(),
        after: 17,
    };
    let mut encoder =
        H264FileEncoder::create(&EncoderConfig::from_recorder(&config, source.resolution()))
            .unwrap();
    source.start().unwrap();

    let plan = SessionPlan::from_config(&config).with_frame_interval(Duration::ZERO);
    let summary = run_session(&mut source, &mut encoder, &plan, &cancel);

    assert_eq!(summary.stop_reason, StopReason::Cancelled);
    assert_eq!(summary.frames_encoded, 17);
    assert_eq!(source.inner.ledger().held(), 0);
    drop(encoder);

    let playback = play_back(&config.output_path, 25);
    assert_eq!(playback.pts.len(), 17);
    assert!(playback.first_is_key);
    assert_eq!(playback.decoded_frames, 17);
}

#[test]
fn test_record_from_paces_and_completes() {
    if !h264_available() {
        eprintln!("skipping: no H.264 encoder");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        output_path: dir.path().join("paced.mkv"),
        resolution: Resolution::new(64, 48),
        fps: 10,
        duration_secs: 1,
        ..Default::default()
    };

    let mut source = TestPatternSource::new(config.resolution, 2);
    let summary = recorder::record_from(&mut source, &config, &CancelFlag::new()).unwrap();

    assert_eq!(summary.stop_reason, StopReason::Completed);
    assert_eq!(summary.frames_encoded, 10);
    // Fixed sleep after every iteration, so never faster than the target rate
    assert!(summary.elapsed >= Duration::from_millis(900));
    assert!(!source.is_streaming());

    let playback = play_back(&config.output_path, 10);
    assert_eq!(playback.pts.len(), 10);
}

#[test]
fn test_missing_device_is_a_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = RecorderConfig {
        device_path: "/dev/this-video-device-does-not-exist".into(),
        output_path: dir.path().join("never.mp4"),
        ..Default::default()
    };

    let err = recorder::record(&config, &CancelFlag::new()).unwrap_err();
    assert!(err.is_setup_error());
    assert!(!config.output_path.exists());
}
