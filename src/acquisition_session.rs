// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Drives one calibration capture run: a sequence of (exposure, shot count)
//! steps executed against a FrameSource, with one CaptureRecord appended to a
//! MetadataSink per saved frame.
//!
//! State machine:
//!   Idle -> Initialized -> Acquiring -> Draining -> Closed
//! with Failed reachable from any state but Closed. Errors are accumulated in
//! the SessionResult; frames captured before a failure stay on disk and in
//! the metadata sink.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use canonical_error::CanonicalError;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::dataset_layout::image_file_name;
use crate::exposure_planner::ExposurePlan;
use crate::frame_source::{ExposureBounds, FrameDelivery, FrameSource};
use crate::frame_stats::central_mean;
use crate::metadata_log::{CaptureRecord, MetadataSink};

pub const DEFAULT_VIGNETTE_FRAMES: u32 = 800;
pub const DEFAULT_RESPONSE_FRAMES: u32 = 1000;
pub const DEFAULT_MAX_RETRIES_PER_FRAME: u32 = 10;
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(1000);

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

// Side length of the central region whose brightness is logged per frame.
const STATS_REGION_SIZE: u32 = 30;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DatasetMode {
    /// Constant exposure, many frames; measures lens/sensor shading.
    Vignette,
    /// Frames swept over an exposure plan; measures the response curve.
    Response,
}

impl fmt::Display for DatasetMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DatasetMode::Vignette => write!(f, "vignette"),
            DatasetMode::Response => write!(f, "response"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initialized,
    Acquiring,
    Draining,
    Closed,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StepExposure {
    /// Shoot with whatever exposure the device currently holds.
    AsIs,
    /// Set this exposure (microseconds) before shooting.
    Fixed(f64),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExposureStep {
    pub exposure: StepExposure,
    pub shots: u32,
}

/// Vignette runs are a single step. The exposure is left alone here; the
/// session pins it during initialization when configured to.
pub fn vignette_steps(total_frames: u32) -> Vec<ExposureStep> {
    vec![ExposureStep{exposure: StepExposure::AsIs, shots: total_frames}]
}

/// One step per planned exposure. Each step gets `total_frames / plan.len()`
/// shots (rounded down) and the last step also takes the remainder, so the
/// shot counts always sum to `total_frames`.
pub fn response_steps(plan: &ExposurePlan, total_frames: u32) -> Vec<ExposureStep> {
    let len = plan.len() as u32;
    if len == 0 {
        return vec![];
    }
    let base = total_frames / len;
    if base == 0 {
        warn!("{} frames spread over {} exposures; only the last exposure is shot",
              total_frames, len);
    }
    plan.iter().enumerate().map(|(i, exposure_us)| {
        let shots = if i as u32 == len - 1 {
            total_frames - base * (len - 1)
        } else {
            base
        };
        ExposureStep{exposure: StepExposure::Fixed(*exposure_us), shots}
    }).collect()
}

/// Frames collected when the caller does not ask for a count.
pub fn default_total_frames(mode: DatasetMode) -> u32 {
    match mode {
        DatasetMode::Vignette => DEFAULT_VIGNETTE_FRAMES,
        DatasetMode::Response => DEFAULT_RESPONSE_FRAMES,
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub mode: DatasetMode,

    /// Vignette mode only. When true the exposure is switched to manual and
    /// held for the whole run.
    pub fix_exposure_for_vignette: bool,

    /// Vignette exposure to pin. None pins the device's current exposure.
    pub vignette_exposure_us: Option<f64>,

    /// Attempts allowed per frame slot before it is skipped. At least 1.
    pub max_retries_per_frame: u32,

    pub frame_timeout: Duration,
}

impl SessionConfig {
    pub fn new(mode: DatasetMode) -> Self {
        SessionConfig{
            mode,
            fix_exposure_for_vignette: true,
            vignette_exposure_us: None,
            max_retries_per_frame: DEFAULT_MAX_RETRIES_PER_FRAME,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum CaptureError {
    /// Every attempt for frame slot `slot` came back incomplete; the slot was
    /// skipped.
    Incomplete { slot: u64, exposure_us: f64, attempts: u32 },

    /// The device or an output failed; the session moved to Failed from
    /// `state`.
    Fatal { state: SessionState, error: CanonicalError },
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaptureError::Incomplete{slot, exposure_us, attempts} =>
                write!(f, "frame slot {} at {:.3}us incomplete after {} attempts",
                       slot, exposure_us, attempts),
            CaptureError::Fatal{state, error} =>
                write!(f, "fatal error in state {:?}: {}", state, error),
        }
    }
}

#[derive(Debug)]
pub struct SessionResult {
    pub mode: DatasetMode,
    pub frames_requested: u64,
    pub frames_captured: u64,
    pub errors: Vec<CaptureError>,
    pub final_state: SessionState,

    /// Non-fatal problems while restoring the device; these never make a run
    /// unsuccessful.
    pub teardown_warnings: Vec<String>,
}

impl SessionResult {
    pub fn failed(&self) -> bool {
        self.final_state == SessionState::Failed
    }

    pub fn skipped_frames(&self) -> usize {
        self.errors.iter()
            .filter(|e| matches!(e, CaptureError::Incomplete{..}))
            .count()
    }

    /// A run is successful if nothing fatal happened and at least one frame
    /// was saved. Skipped slots are tolerated.
    pub fn is_success(&self) -> bool {
        !self.failed() && self.frames_captured > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }
}

impl fmt::Display for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} dataset: captured {}/{} frames, {} skipped, {} teardown warnings, final state {:?}",
               self.mode, self.frames_captured, self.frames_requested,
               self.skipped_frames(), self.teardown_warnings.len(), self.final_state)
    }
}

pub struct AcquisitionSession<M: MetadataSink> {
    source: Box<dyn FrameSource + Send>,
    sink: M,
    config: SessionConfig,
    image_dir: PathBuf,
    cancel: Option<Arc<AtomicBool>>,

    state: SessionState,
    serial_number: Option<String>,
    bounds: Option<ExposureBounds>,
    current_exposure_us: f64,

    // What teardown has to undo.
    exposure_touched: bool,
    acquisition_started: bool,
    released: bool,

    next_slot: u64,
    next_frame_index: u64,
    frames_requested: u64,
    frames_captured: u64,
    errors: Vec<CaptureError>,
    teardown_warnings: Vec<String>,
}

impl<M: MetadataSink> AcquisitionSession<M> {
    /// The session takes ownership of `source` and `sink` until it is
    /// dropped. Images are written into `image_dir`, which must exist.
    pub fn new(source: Box<dyn FrameSource + Send>, sink: M,
               config: SessionConfig, image_dir: PathBuf) -> Self {
        AcquisitionSession{source, sink, config, image_dir,
                           cancel: None,
                           state: SessionState::Idle,
                           serial_number: None,
                           bounds: None,
                           current_exposure_us: 0.0,
                           exposure_touched: false,
                           acquisition_started: false,
                           released: false,
                           next_slot: 0,
                           next_frame_index: 0,
                           frames_requested: 0,
                           frames_captured: 0,
                           errors: vec![],
                           teardown_warnings: vec![]}
    }

    /// When `cancel` is raised the session stops before the next frame slot
    /// and drains normally.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sink(&self) -> &M {
        &self.sink
    }

    /// Runs the whole session: initialize, acquire `steps`, close. Always
    /// returns a result, whether or not the run failed.
    pub async fn run(&mut self, steps: &[ExposureStep]) -> SessionResult {
        if self.initialize() == SessionState::Initialized {
            self.acquire(steps).await;
        } else {
            self.frames_requested = total_shots(steps);
        }
        self.close().await;
        self.result()
    }

    /// Idle -> Initialized. Puts the device in continuous acquisition mode
    /// and, for a vignette run with fixed exposure, pins the exposure.
    pub fn initialize(&mut self) -> SessionState {
        if self.state != SessionState::Idle {
            warn!("initialize() called in state {:?}", self.state);
            return self.state;
        }
        info!("Initializing {} for {} dataset", self.source.model(), self.config.mode);
        self.serial_number = self.source.serial_number();
        match &self.serial_number {
            Some(serial) => info!("Device serial number {}", serial),
            None => info!("Device reports no serial number"),
        }
        match self.init_device() {
            Ok(()) => self.state = SessionState::Initialized,
            Err(e) => self.fail(e),
        }
        self.state
    }

    fn init_device(&mut self) -> Result<(), CanonicalError> {
        self.source.set_continuous_acquisition()?;
        info!("Acquisition mode set to continuous");
        let bounds = self.source.exposure_bounds()?;
        info!("Exposure bounds {}", bounds);
        self.bounds = Some(bounds);
        self.current_exposure_us = self.source.get_exposure()?;
        if self.config.mode == DatasetMode::Vignette && self.config.fix_exposure_for_vignette {
            let requested = self.config.vignette_exposure_us
                .unwrap_or(self.current_exposure_us);
            // A failed write may still have left manual exposure on.
            self.exposure_touched = true;
            self.current_exposure_us = self.source.set_exposure(bounds.clamp(requested))?;
            info!("Vignette exposure fixed at {:.3}us", self.current_exposure_us);
        }
        Ok(())
    }

    /// Initialized -> Acquiring -> Draining (or Failed). Shoots every step's
    /// quota of frames. Frame slots whose retries run out are recorded and
    /// skipped; any device or output error fails the session.
    pub async fn acquire(&mut self, steps: &[ExposureStep]) -> SessionState {
        if self.state != SessionState::Initialized {
            warn!("acquire() called in state {:?}", self.state);
            return self.state;
        }
        self.frames_requested = total_shots(steps);
        self.state = SessionState::Acquiring;
        if let Err(e) = self.source.begin_acquisition() {
            self.fail(e);
            return self.state;
        }
        self.acquisition_started = true;
        info!("Acquiring {} frames over {} exposure steps",
              self.frames_requested, steps.len());

        'steps: for (step_index, step) in steps.iter().enumerate() {
            if step.shots == 0 {
                continue;
            }
            if self.cancelled() {
                break;
            }
            if let StepExposure::Fixed(exposure_us) = step.exposure {
                if let Err(e) = self.apply_exposure(exposure_us) {
                    self.fail(e);
                    break;
                }
            }
            info!("Step {}/{}: {} frames at {:.3}us",
                  step_index + 1, steps.len(), step.shots, self.current_exposure_us);
            for _ in 0..step.shots {
                if self.cancelled() {
                    break 'steps;
                }
                if let Err(e) = self.capture_slot().await {
                    self.fail(e);
                    break 'steps;
                }
            }
        }
        if self.state == SessionState::Acquiring {
            self.state = SessionState::Draining;
        }
        self.state
    }

    fn apply_exposure(&mut self, exposure_us: f64) -> Result<(), CanonicalError> {
        let mut target = exposure_us;
        if let Some(bounds) = self.bounds {
            target = bounds.clamp(exposure_us);
            if target != exposure_us {
                warn!("Exposure {:.3}us outside {}; using {:.3}us",
                      exposure_us, bounds, target);
            }
        }
        self.exposure_touched = true;
        self.current_exposure_us = self.source.set_exposure(target)?;
        debug!("Shutter time set to {:.3}us", self.current_exposure_us);
        Ok(())
    }

    // Fills one frame slot. Returns Ok if the slot was filled or skipped after
    // exhausting its retries; Err only for failures that end the session.
    async fn capture_slot(&mut self) -> Result<(), CanonicalError> {
        let slot = self.next_slot;
        self.next_slot += 1;
        let max_attempts = self.config.max_retries_per_frame.max(1);
        for attempt in 1..=max_attempts {
            let frame = match self.source.next_frame(self.config.frame_timeout).await? {
                FrameDelivery::Complete(frame) => frame,
                FrameDelivery::Incomplete => {
                    debug!("Slot {}: incomplete frame (attempt {}/{})",
                           slot, attempt, max_attempts);
                    continue;
                },
            };
            let capture_time_millis =
                DateTime::<Utc>::from(frame.readout_time).timestamp_millis();
            let frame_index = self.next_frame_index;
            let path = self.image_dir.join(image_file_name(
                self.serial_number.as_deref(), frame_index, capture_time_millis));
            self.source.save_frame(&frame, &path)?;
            self.sink.append(CaptureRecord{frame_index,
                                           capture_time_millis,
                                           exposure_us: frame.exposure_us})?;
            self.next_frame_index += 1;
            self.frames_captured += 1;
            debug!("Saved {:?} (frame id {}, {:.3}us, center mean {:.1})",
                   path, frame.frame_id, frame.exposure_us,
                   central_mean(&frame.image, STATS_REGION_SIZE).unwrap_or(0.0));
            return Ok(());
        }
        warn!("Skipping frame slot {} at {:.3}us after {} incomplete attempts",
              slot, self.current_exposure_us, max_attempts);
        self.errors.push(CaptureError::Incomplete{slot,
                                                  exposure_us: self.current_exposure_us,
                                                  attempts: max_attempts});
        Ok(())
    }

    /// Draining (or Failed) -> Closed (or Failed). Ends acquisition, restores
    /// automatic exposure if the session changed it, releases the device and
    /// flushes the metadata sink. Device restore problems are only warnings.
    pub async fn close(&mut self) -> SessionState {
        if self.state == SessionState::Closed {
            return self.state;
        }
        if self.state != SessionState::Draining && self.state != SessionState::Failed {
            warn!("Closing session early from state {:?}", self.state);
        }
        self.teardown().await;
        if let Err(e) = self.sink.flush() {
            self.fail(e);
        }
        if self.state != SessionState::Failed {
            self.state = SessionState::Closed;
        }
        self.state
    }

    async fn teardown(&mut self) {
        if self.released {
            return;
        }
        if self.acquisition_started {
            self.acquisition_started = false;
            if let Err(e) = self.source.end_acquisition().await {
                self.teardown_warning(format!("Could not end acquisition: {}", e));
            }
        }
        if self.exposure_touched {
            self.exposure_touched = false;
            match self.source.restore_auto_exposure() {
                Ok(()) => info!("Automatic exposure enabled"),
                Err(e) => self.teardown_warning(
                    format!("Unable to enable automatic exposure: {}", e)),
            }
        }
        self.source.release();
        self.released = true;
    }

    fn teardown_warning(&mut self, message: String) {
        warn!("{}. Non-fatal", message);
        self.teardown_warnings.push(message);
    }

    fn fail(&mut self, error: CanonicalError) {
        error!("Session failed in state {:?}: {}", self.state, error);
        self.errors.push(CaptureError::Fatal{state: self.state, error});
        self.state = SessionState::Failed;
    }

    fn cancelled(&self) -> bool {
        let cancelled = self.cancel.as_ref()
            .map_or(false, |flag| flag.load(Ordering::SeqCst));
        if cancelled {
            warn!("Capture cancelled after {} frames", self.frames_captured);
        }
        cancelled
    }

    fn result(&mut self) -> SessionResult {
        SessionResult{mode: self.config.mode,
                      frames_requested: self.frames_requested,
                      frames_captured: self.frames_captured,
                      errors: std::mem::take(&mut self.errors),
                      final_state: self.state,
                      teardown_warnings: std::mem::take(&mut self.teardown_warnings)}
    }
}

/// Sleeps for `duration`, waking early once `cancel` is raised. Returns
/// false if cancelled.
pub async fn wait_unless_cancelled(duration: Duration, cancel: &AtomicBool) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    while !cancel.load(Ordering::SeqCst) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep(CANCEL_POLL_INTERVAL.min(deadline - now)).await;
    }
    false
}

fn total_shots(steps: &[ExposureStep]) -> u64 {
    steps.iter().map(|s| s.shots as u64).sum()
}

/// A session dropped without close() still releases the device.
impl<M: MetadataSink> Drop for AcquisitionSession<M> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Session dropped in state {:?}; releasing device", self.state);
            futures::executor::block_on(self.teardown());
            if let Err(e) = self.sink.flush() {
                error!("Could not flush metadata: {}", e);
            }
        }
    }
}
