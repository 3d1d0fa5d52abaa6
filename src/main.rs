use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webcam_recorder::config::{self, ConfigOverrides, RecorderConfig};
use webcam_recorder::recorder::{self, CancelFlag, RecordingSummary, StopReason};
use webcam_recorder::video::TestPatternSource;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// webcam-recorder command line arguments
#[derive(Parser, Debug)]
#[command(name = "webcam-recorder")]
#[command(version, about = "Record a V4L2 webcam into an H.264 video file", long_about = None)]
struct CliArgs {
    /// Capture device (default: /dev/video0)
    #[arg(value_name = "DEVICE")]
    device: Option<PathBuf>,

    /// Output file; the container is chosen from the extension (default: webcam_video.mp4)
    #[arg(value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// JSON configuration file (duration, fps, buffers, encoder tuning)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Record a synthetic test pattern instead of a capture device
    #[arg(long)]
    test_pattern: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    let overrides = ConfigOverrides {
        device_path: args.device,
        output_path: args.output,
    };
    let config = config::load_config(args.config.as_deref(), overrides)
        .context("Invalid configuration")?;

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || handler_flag.cancel())
        .context("Failed to install Ctrl+C handler")?;

    print_banner(&config, args.test_pattern);

    let summary = if args.test_pattern {
        let mut source = TestPatternSource::new(config.resolution, config.buffer_count as usize);
        recorder::record_from(&mut source, &config, &cancel)
    } else {
        recorder::record(&config, &cancel)
    }
    .with_context(|| {
        format!(
            "Failed to start recording from {}",
            source_label(&config, args.test_pattern)
        )
    })?;

    report(&config, &summary);
    Ok(())
}

/// Human-readable name of the frame source in use
fn source_label(config: &RecorderConfig, test_pattern: bool) -> String {
    if test_pattern {
        format!("test pattern {}", config.resolution)
    } else {
        format!("device {}", config.device_path.display())
    }
}

fn print_banner(config: &RecorderConfig, test_pattern: bool) {
    tracing::info!("Starting webcam-recorder v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Source: {}", source_label(config, test_pattern));
    tracing::info!("Output: {}", config.output_path.display());
    tracing::info!(
        "Recording {} seconds at {} fps ({} frames), press Ctrl+C to stop early",
        config.duration_secs,
        config.fps,
        config.target_frames()
    );
}

fn report(config: &RecorderConfig, summary: &RecordingSummary) {
    match &summary.stop_reason {
        StopReason::Completed => tracing::info!("Recording complete"),
        StopReason::Cancelled => tracing::info!("Recording stopped early"),
        StopReason::Failed(reason) => tracing::error!("Recording ended with an error: {}", reason),
    }

    tracing::info!("Video saved to: {}", config.output_path.display());
    tracing::info!(
        "Frames written: {} ({:.1} s of video, {} packets)",
        summary.frames_encoded,
        summary.recorded_secs(config.fps),
        summary.packets_written
    );
    tracing::info!(
        "Wall clock: {:.2} s, average {:.2} fps, {} capture timeouts",
        summary.elapsed.as_secs_f64(),
        summary.average_fps(),
        summary.timeouts
    );
}

/// Initialize logging with CLI arguments
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "webcam_recorder=error",
        LogLevel::Warn => "webcam_recorder=warn",
        LogLevel::Info => "webcam_recorder=info",
        LogLevel::Verbose => "webcam_recorder=debug",
        LogLevel::Debug => "webcam_recorder=debug",
        LogLevel::Trace => "webcam_recorder=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
