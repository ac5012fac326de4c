// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error};
use image::GrayImage;

/// Range of exposure durations, in microseconds, that the device can
/// implement. Read from the device; the session never sets an exposure
/// outside of it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExposureBounds {
    pub min_us: f64,
    pub max_us: f64,
}

impl fmt::Display for ExposureBounds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:.3}us, {:.3}us]", self.min_us, self.max_us)
    }
}

impl ExposureBounds {
    pub fn clamp(&self, exposure_us: f64) -> f64 {
        exposure_us.max(self.min_us).min(self.max_us)
    }
}

/// A complete frame delivered by a FrameSource, already converted to 8-bit
/// greyscale.
#[derive(Clone)]
pub struct Frame {
    pub image: Arc<GrayImage>,

    /// Exposure the device used for this frame.
    pub exposure_us: f64,

    pub readout_time: SystemTime,

    /// Device-assigned sequence number. Not necessarily contiguous.
    pub frame_id: i32,
}

pub enum FrameDelivery {
    Complete(Frame),

    /// The device timed out or handed back a frame with missing packets.
    /// Transient; the caller may ask again.
    Incomplete,
}

/// FrameSource models the camera (vendor SDK) that a calibration session
/// drives. A FrameSource is owned exclusively by one session at a time; all
/// calls are made sequentially.
#[async_trait]
pub trait FrameSource {
    /// Returns a string identifying what kind of camera this is.
    fn model(&self) -> String;

    /// Device serial number, used to keep image filenames unique across
    /// cameras. None if the device does not report one.
    fn serial_number(&self) -> Option<String>;

    fn exposure_bounds(&self) -> Result<ExposureBounds, CanonicalError>;

    /// Returns the exposure to be used for the next frame.
    fn get_exposure(&self) -> Result<f64, CanonicalError>;

    /// Turns off automatic exposure and sets a manual exposure. Values above
    /// the device maximum are clamped; the applied value is returned.
    fn set_exposure(&mut self, exposure_us: f64) -> Result<f64, CanonicalError>;

    /// Returns the device to automatic exposure.
    fn restore_auto_exposure(&mut self) -> Result<(), CanonicalError>;

    /// Frames are produced continuously between begin_acquisition() and
    /// end_acquisition() rather than one-shot triggered.
    fn set_continuous_acquisition(&mut self) -> Result<(), CanonicalError>;

    fn begin_acquisition(&mut self) -> Result<(), CanonicalError>;

    /// Waits up to `timeout` for the next frame. A timeout is reported as
    /// FrameDelivery::Incomplete, not as an error. Errors indicate the device
    /// is unusable (e.g. not streaming).
    async fn next_frame(&mut self, timeout: Duration)
                        -> Result<FrameDelivery, CanonicalError>;

    /// Many implementations will treat this as a no-op if acquisition is not
    /// running.
    async fn end_acquisition(&mut self) -> Result<(), CanonicalError>;

    /// Writes `frame` to `path`; the image format follows the extension.
    fn save_frame(&self, frame: &Frame, path: &Path) -> Result<(), CanonicalError> {
        frame.image.save(path).map_err(|e| failed_precondition_error(
            format!("Could not save {:?}: {}", path, e).as_str()))
    }

    /// Releases the device handle. No other method may be called afterwards.
    fn release(&mut self);
}
