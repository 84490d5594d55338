//! v4l2-cam-capture binary: pull frames from one or more cameras and log them.

use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::Layer;

use v4l2_cam_capture::{CaptureConfig, CaptureSession, ClockOffset, RigConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Capture frames from V4L2 cameras through a single memory-mapped buffer.
#[derive(Debug, Parser)]
#[command(name = "v4l2-cam-capture", version, about)]
struct Cli {
    /// TOML file with one camera or a `[[camera]]` rig. Overrides the camera flags.
    #[arg(short, long, env = "V4L2_CAM_CAPTURE_CONFIG")]
    config: Option<PathBuf>,

    /// Device node.
    #[arg(short, long, default_value = "/dev/video0")]
    device: PathBuf,

    /// Logical camera identifier.
    #[arg(long, default_value = "cam_0")]
    cam_id: String,

    /// Device serial number (informational).
    #[arg(long, default_value_t = 0)]
    serial: i64,

    /// Sensor width in pixels.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Sensor height in pixels.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Pixel format selector: 1 = planar YUV420, 2 = Y16, 5 = YUYV.
    #[arg(short, long, default_value_t = 1)]
    format: u32,

    /// Stop after this many frames per camera.
    #[arg(short = 'n', long)]
    frames: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let result = run(&cli);
    if let Err(ref e) = result {
        error!(error = %e, "capture failed");
    }
    result
}

fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = match cli.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_names(true)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
        LogFormat::Compact => fmt::layer().compact().with_thread_names(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))
}

fn cameras(cli: &Cli) -> Result<Vec<CaptureConfig>> {
    let Some(path) = cli.config.as_ref() else {
        let config = CaptureConfig::new(&cli.cam_id, &cli.device, cli.width, cli.height)
            .with_serial(cli.serial)
            .with_selector(cli.format);
        return Ok(vec![config]);
    };

    let rig = match RigConfig::load(path) {
        Ok(rig) => rig,
        Err(rig_err) => {
            let single = CaptureConfig::load(path)
                .with_context(|| format!("{} is neither a rig nor a camera: {rig_err}", path.display()))?;
            return Ok(vec![single]);
        }
    };
    if rig.cameras.is_empty() {
        return Err(anyhow!("{} lists no cameras", path.display()));
    }
    if !rig.shared_clock_offset {
        return Ok(rig.cameras);
    }

    let shared = ClockOffset::estimate().context("failed to estimate the shared clock offset")?;
    info!(offset_ms = shared.as_millis(), "sharing clock offset across cameras");
    Ok(rig
        .cameras
        .into_iter()
        .map(|config| match config.epoch_offset_ms {
            Some(ms) if ms != 0 => config,
            _ => config.with_epoch_offset_ms(shared.as_millis()),
        })
        .collect())
}

fn capture(config: CaptureConfig, limit: Option<u64>) -> Result<u64> {
    let description = config.description();
    let mut camera = CaptureSession::new(config)
        .with_context(|| format!("failed to create session for {description}"))?;
    camera
        .initialize()
        .with_context(|| format!("failed to initialize {description}"))?;

    let mut pulled = 0;
    while limit.is_none_or(|limit| pulled < limit) {
        let frame = camera.pull_next_frame()?;
        info!(
            cam_id = %frame.cam_id,
            sequence = frame.metadata.sequence,
            width = frame.image.width(),
            height = frame.image.height(),
            channels = frame.image.channels(),
            timestamp_ns = frame.timestamp_ns,
            "frame"
        );
        pulled += 1;
    }

    camera.teardown();
    Ok(pulled)
}

fn run(cli: &Cli) -> Result<()> {
    let configs = cameras(cli)?;
    info!(cameras = configs.len(), "starting capture");

    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let name = config.cam_id.clone();
        let limit = cli.frames;
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || capture(config, limit))
            .with_context(|| format!("failed to spawn capture thread for {name}"))?;
        handles.push((name, handle));
    }

    let mut first_error = None;
    for (name, handle) in handles {
        let outcome = handle
            .join()
            .map_err(|_| anyhow!("capture thread for {name} panicked"))
            .and_then(|result| result);
        match outcome {
            Ok(frames) => info!(cam_id = %name, frames, "capture finished"),
            Err(err) => {
                warn!(cam_id = %name, error = %err, "capture stopped");
                first_error.get_or_insert(err);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}
