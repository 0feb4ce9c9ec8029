//! Camera-session binary: open a V4L2 camera, stream preview frames and
//! optionally take a still.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camera_session::device::{FrameConsumer, PreviewFrame};
use camera_session::request::{CaptureKind, Rotation};
use camera_session::{
    CameraController, CameraError, ControllerConfig, DeviceEnumerator, HeadlessOutput, V4l2Provider,
};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "camera-session",
    about = "Stream a V4L2 camera through the session controller"
)]
struct Cli {
    /// TOML controller configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device index to use; defaults to the preferred camera.
    #[arg(long)]
    device: Option<String>,

    /// Preview frames to stream before stopping.
    #[arg(long, default_value_t = 30)]
    frames: u64,

    /// Write one raw still frame to this file.
    #[arg(long)]
    still: Option<PathBuf>,

    /// Display rotation in degrees (0, 90, 180 or 270).
    #[arg(long, default_value_t = 0)]
    rotation: u32,

    /// Seconds to wait for each step.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(&Cli::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> camera_session::Result<()> {
    let config = match &cli.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    let rotation = Rotation::from_degrees(cli.rotation).unwrap_or_else(|| {
        error!(degrees = cli.rotation, "unsupported rotation, using 0");
        Rotation::Deg0
    });
    let timeout = Duration::from_secs(cli.timeout);

    let frames = Arc::new(AtomicU64::new(0));
    let consumer = frame_consumer(Arc::clone(&frames), cli.still.clone());
    let provider = V4l2Provider::new().with_frame_consumer(consumer);

    let descriptors = provider.enumerate()?;
    for descriptor in &descriptors {
        info!(
            camera = %descriptor.id,
            facing = ?descriptor.facing,
            width = descriptor.max_still_size.width,
            height = descriptor.max_still_size.height,
            "camera"
        );
    }

    let mut controller = CameraController::new(
        descriptors,
        Arc::new(provider),
        Arc::new(HeadlessOutput::new()),
        Arc::new(rotation),
        config,
    )?;

    let id = match &cli.device {
        Some(id) => id.clone(),
        None => controller
            .preferred_device()
            .map(|descriptor| descriptor.id.clone())
            .ok_or_else(|| CameraError::DeviceNotFound("any".to_owned()))?,
    };
    if controller.status(&id).is_none() {
        return Err(CameraError::DeviceNotFound(id));
    }

    controller.open(&id)?;
    controller.wait_until(&id, timeout, |status| status.is_previewing)?;
    info!(camera = %id, "preview running");

    let deadline = Instant::now() + timeout;
    while frames.load(Ordering::Relaxed) < cli.frames {
        if Instant::now() >= deadline {
            return Err(CameraError::Timeout);
        }
        thread::sleep(Duration::from_millis(10));
    }

    if cli.still.is_some() {
        controller.take_picture(&id)?;
        controller.wait_until(&id, timeout, |status| status.stills_completed > 0)?;
    }

    controller.shutdown();
    info!(frames = frames.load(Ordering::Relaxed), "done");
    Ok(())
}

fn frame_consumer(frames: Arc<AtomicU64>, still: Option<PathBuf>) -> FrameConsumer {
    Arc::new(move |frame: &PreviewFrame<'_>| {
        frames.fetch_add(1, Ordering::Relaxed);
        if frame.kind != CaptureKind::Still {
            return;
        }
        let Some(path) = &still else {
            return;
        };
        match fs::write(path, frame.data) {
            Ok(()) => info!(
                camera = %frame.camera_id,
                path = %path.display(),
                bytes = frame.data.len(),
                sequence = frame.metadata.sequence,
                "still written"
            ),
            Err(err) => error!(path = %path.display(), error = %err, "cannot write still"),
        }
    })
}
