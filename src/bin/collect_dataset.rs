// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error};
use clap::{ArgGroup, Parser};
use env_logger;
use log::{error, info, warn};

use photometric_capture::acquisition_session::{
    AcquisitionSession, DEFAULT_MAX_RETRIES_PER_FRAME, DatasetMode, SessionConfig,
    SessionResult, default_total_frames, response_steps, vignette_steps,
    wait_unless_cancelled};
use photometric_capture::dataset_layout::DatasetLayout;
use photometric_capture::exposure_planner::plan;
use photometric_capture::frame_source::{ExposureBounds, FrameSource};
use photometric_capture::metadata_log::MetadataLog;
use photometric_capture::simulated_camera::{DEFAULT_BOUNDS, SimulatedCamera};
use photometric_capture::strategy_args::StrategyArgs;

/// Collects a photometric calibration dataset: a vignette dataset (many
/// frames at one exposure, camera stationary) or a response dataset (frames
/// swept over a range of exposures).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
#[command(group(ArgGroup::new("mode").required(true).args(["vignette", "response"])))]
struct Args {
    /// Collect the vignette dataset.
    #[arg(long)]
    vignette: bool,

    /// Collect the response dataset.
    #[arg(long)]
    response: bool,

    /// Directory in which vignette-dataset/ or response-dataset/ is created.
    #[arg(long, default_value = ".")]
    output_root: PathBuf,

    /// Frames to capture. Defaults to 800 for vignette, 1000 for response.
    #[arg(long)]
    total_frames: Option<u32>,

    #[command(flatten)]
    plan: StrategyArgs,

    /// Vignette exposure in microseconds. Defaults to the camera's current
    /// exposure.
    #[arg(long)]
    vignette_exposure_us: Option<f64>,

    /// Leave the vignette exposure under camera control instead of fixing it.
    #[arg(long)]
    leave_vignette_exposure: bool,

    /// Attempts per frame before an incomplete frame is skipped.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES_PER_FRAME)]
    max_retries: u32,

    /// How long to wait for each frame.
    #[arg(long, default_value_t = 1000)]
    frame_timeout_ms: u64,

    /// Vignette only: seconds to position the camera before capturing.
    #[arg(long, default_value_t = 10)]
    settle_secs: u64,

    /// Write images directly in the dataset directory rather than images/.
    #[arg(long)]
    flat_output: bool,

    /// Do not write the times.txt metadata log.
    #[arg(long)]
    no_metadata: bool,

    /// Simulated camera: scene image. Defaults to a synthetic vignetted
    /// target.
    #[arg(long)]
    source_image: Option<PathBuf>,

    /// Simulated camera: width of the synthetic target.
    #[arg(long, default_value_t = 640)]
    sensor_width: u32,

    /// Simulated camera: height of the synthetic target.
    #[arg(long, default_value_t = 512)]
    sensor_height: u32,

    /// Simulated camera: minimum exposure in microseconds.
    #[arg(long, default_value_t = DEFAULT_BOUNDS.min_us)]
    exposure_min_us: f64,

    /// Simulated camera: maximum exposure in microseconds.
    #[arg(long, default_value_t = DEFAULT_BOUNDS.max_us)]
    exposure_max_us: f64,

    /// Simulated camera: make every Nth frame incomplete. 0 disables.
    #[arg(long, default_value_t = 0)]
    incomplete_every: u32,

    /// Simulated camera: serial number used in image filenames.
    #[arg(long)]
    serial: Option<String>,
}

fn open_camera(args: &Args) -> Result<SimulatedCamera, CanonicalError> {
    let camera = match &args.source_image {
        Some(path) => {
            let scene = image::open(path).map_err(|e| failed_precondition_error(
                format!("Could not read {:?}: {}", path, e).as_str()))?;
            SimulatedCamera::from_image(scene.to_luma8())?
        },
        None => SimulatedCamera::new(args.sensor_width, args.sensor_height)?,
    };
    let mut camera = camera
        .with_bounds(ExposureBounds{min_us: args.exposure_min_us,
                                    max_us: args.exposure_max_us})?
        .with_incomplete_every(args.incomplete_every);
    if let Some(serial) = &args.serial {
        camera = camera.with_serial_number(serial);
    }
    Ok(camera)
}

async fn collect(args: Args) -> Result<SessionResult, CanonicalError> {
    let mode = if args.vignette { DatasetMode::Vignette } else { DatasetMode::Response };
    info!("Running {} dataset collection", mode);

    let camera = open_camera(&args)?;
    info!("camera: {}", camera.model());
    let bounds = camera.exposure_bounds()?;

    let total_frames = args.total_frames.unwrap_or(default_total_frames(mode));
    let mut config = SessionConfig::new(mode);
    config.fix_exposure_for_vignette = !args.leave_vignette_exposure;
    config.vignette_exposure_us = args.vignette_exposure_us;
    config.max_retries_per_frame = args.max_retries;
    config.frame_timeout = Duration::from_millis(args.frame_timeout_ms);

    let steps = match mode {
        DatasetMode::Vignette => vignette_steps(total_frames),
        DatasetMode::Response => {
            let plan = plan(bounds.min_us, bounds.max_us, args.plan.samples,
                            &args.plan.strategy())?;
            info!("Exposure plan: {}", plan);
            response_steps(&plan, total_frames)
        },
    };

    let layout = DatasetLayout::new(&args.output_root, mode, !args.flat_output);
    layout.create()?;
    let sink = if args.no_metadata {
        None
    } else {
        Some(MetadataLog::open(&layout.metadata_path)?)
    };

    // Ctrl-C stops capture after the current frame; the camera is still
    // restored and the metadata flushed. Armed before the settle delay so an
    // interrupt there is not lost.
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current frame");
            watcher.store(true, Ordering::SeqCst);
        }
    });

    if mode == DatasetMode::Vignette && args.settle_secs > 0 {
        info!("You have {} seconds to position your camera!", args.settle_secs);
        if !wait_unless_cancelled(Duration::from_secs(args.settle_secs), &cancel).await {
            warn!("Interrupted while positioning the camera; no frames will be taken");
        }
    }

    let mut session = AcquisitionSession::new(
        Box::new(camera), sink, config, layout.image_dir.clone())
        .with_cancel_flag(cancel);
    let result = session.run(&steps).await;
    if let Some(log) = session.sink() {
        info!("Wrote {} lines to {:?}", log.lines_written(), log.path());
    }
    Ok(result)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let exit_code = match collect(args).await {
        Ok(result) => {
            for err in &result.errors {
                warn!("{}", err);
            }
            info!("{}", result);
            result.exit_code()
        },
        Err(e) => {
            error!("{}", e);
            1
        },
    };
    std::process::exit(exit_code);
}
