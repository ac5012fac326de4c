// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Fake camera that renders a fixed scene at the requested exposure. For
// testing and for dry runs without hardware.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error,
                      invalid_argument_error};
use image::{GrayImage, Luma};
use log::{debug, info};

use crate::frame_source::{ExposureBounds, Frame, FrameDelivery, FrameSource};

pub const DEFAULT_BOUNDS: ExposureBounds = ExposureBounds{min_us: 50.0, max_us: 51200.0};

// Exposure at which the scene's pixel values are rendered unscaled.
const REFERENCE_EXPOSURE_US: f64 = 5000.0;

// Exponent of the simulated (non-linear) sensor response.
const RESPONSE_GAMMA: f64 = 1.0 / 2.2;

pub struct SimulatedCamera {
    // Scene radiance, as the image seen at REFERENCE_EXPOSURE_US with a
    // linear response.
    scene: Arc<GrayImage>,
    bounds: ExposureBounds,
    serial_number: Option<String>,

    exposure_us: f64,
    auto_exposure: bool,
    continuous: bool,
    acquiring: bool,
    released: bool,

    // Frames are paced at the exposure duration unless disabled.
    paced: bool,
    // Every Nth delivery is incomplete (dropped packets).
    incomplete_every: Option<u32>,

    deliveries: u32,
    frame_id: i32,
    last_frame_time: Instant,
}

impl SimulatedCamera {
    /// Simulates a camera looking at a uniformly lit target through a lens
    /// with radial falloff.
    pub fn new(width: u32, height: u32) -> Result<Self, CanonicalError> {
        if width == 0 || height == 0 {
            return Err(invalid_argument_error(
                format!("Bad simulated sensor size {}x{}", width, height).as_str()));
        }
        Self::from_image(vignetted_scene(width, height))
    }

    /// Simulates a camera looking at `scene`.
    pub fn from_image(scene: GrayImage) -> Result<Self, CanonicalError> {
        Ok(SimulatedCamera{scene: Arc::new(scene),
                           bounds: DEFAULT_BOUNDS,
                           serial_number: None,
                           exposure_us: REFERENCE_EXPOSURE_US,
                           auto_exposure: true,
                           continuous: false,
                           acquiring: false,
                           released: false,
                           paced: true,
                           incomplete_every: None,
                           deliveries: 0,
                           frame_id: 0,
                           last_frame_time: Instant::now()})
    }

    pub fn with_bounds(mut self, bounds: ExposureBounds) -> Result<Self, CanonicalError> {
        if !(bounds.min_us > 0.0) || bounds.max_us < bounds.min_us {
            return Err(invalid_argument_error(
                format!("Bad simulated exposure bounds {}", bounds).as_str()));
        }
        self.bounds = bounds;
        self.exposure_us = bounds.clamp(self.exposure_us);
        Ok(self)
    }

    pub fn with_serial_number(mut self, serial_number: &str) -> Self {
        self.serial_number = Some(serial_number.to_string());
        self
    }

    pub fn with_pacing(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    /// Zero disables incomplete deliveries.
    pub fn with_incomplete_every(mut self, n: u32) -> Self {
        self.incomplete_every = if n == 0 { None } else { Some(n) };
        self
    }

    pub fn auto_exposure(&self) -> bool {
        self.auto_exposure
    }

    fn check_open(&self) -> Result<(), CanonicalError> {
        if self.released {
            return Err(failed_precondition_error("Camera has been released"));
        }
        Ok(())
    }

    fn render(&self) -> GrayImage {
        let scale = self.exposure_us / REFERENCE_EXPOSURE_US;
        let mut image = GrayImage::new(self.scene.width(), self.scene.height());
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let radiance = self.scene.get_pixel(x, y).0[0] as f64 / 255.0;
            let exposed = (radiance * scale).min(1.0);
            *pixel = Luma([(255.0 * exposed.powf(RESPONSE_GAMMA)).round() as u8]);
        }
        image
    }
}

fn vignetted_scene(width: u32, height: u32) -> GrayImage {
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;
    let max_r2 = cx * cx + cy * cy;
    GrayImage::from_fn(width, height, |x, y| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let r2 = if max_r2 > 0.0 { (dx * dx + dy * dy) / max_r2 } else { 0.0 };
        Luma([(120.0 * (1.0 - 0.6 * r2)).round() as u8])
    })
}

#[async_trait]
impl FrameSource for SimulatedCamera {
    fn model(&self) -> String {
        "SimulatedCamera".to_string()
    }

    fn serial_number(&self) -> Option<String> {
        self.serial_number.clone()
    }

    fn exposure_bounds(&self) -> Result<ExposureBounds, CanonicalError> {
        self.check_open()?;
        Ok(self.bounds)
    }

    fn get_exposure(&self) -> Result<f64, CanonicalError> {
        self.check_open()?;
        Ok(self.exposure_us)
    }

    fn set_exposure(&mut self, exposure_us: f64) -> Result<f64, CanonicalError> {
        self.check_open()?;
        if !(exposure_us > 0.0) {
            return Err(invalid_argument_error(
                format!("Exposure must be positive, got {}", exposure_us).as_str()));
        }
        self.auto_exposure = false;
        self.exposure_us = exposure_us.min(self.bounds.max_us).max(self.bounds.min_us);
        Ok(self.exposure_us)
    }

    fn restore_auto_exposure(&mut self) -> Result<(), CanonicalError> {
        self.check_open()?;
        self.auto_exposure = true;
        Ok(())
    }

    fn set_continuous_acquisition(&mut self) -> Result<(), CanonicalError> {
        self.check_open()?;
        self.continuous = true;
        Ok(())
    }

    fn begin_acquisition(&mut self) -> Result<(), CanonicalError> {
        self.check_open()?;
        if !self.continuous {
            return Err(failed_precondition_error(
                "Acquisition mode must be continuous before acquiring"));
        }
        self.acquiring = true;
        self.last_frame_time = Instant::now();
        Ok(())
    }

    async fn next_frame(&mut self, timeout: Duration)
                        -> Result<FrameDelivery, CanonicalError> {
        self.check_open()?;
        if !self.acquiring {
            return Err(failed_precondition_error("Camera is not streaming"));
        }
        self.deliveries += 1;
        if self.paced {
            let interval = Duration::from_secs_f64(self.exposure_us / 1_000_000.0);
            let next_frame_time = self.last_frame_time + interval;
            let sleep_interval = next_frame_time.saturating_duration_since(Instant::now());
            if sleep_interval > timeout {
                tokio::time::sleep(timeout).await;
                return Ok(FrameDelivery::Incomplete);
            }
            tokio::time::sleep(sleep_interval).await;
        }
        self.last_frame_time = Instant::now();
        if let Some(n) = self.incomplete_every {
            if self.deliveries % n == 0 {
                debug!("Simulating incomplete frame at delivery {}", self.deliveries);
                return Ok(FrameDelivery::Incomplete);
            }
        }
        self.frame_id += 1;
        Ok(FrameDelivery::Complete(Frame{image: Arc::new(self.render()),
                                         exposure_us: self.exposure_us,
                                         readout_time: SystemTime::now(),
                                         frame_id: self.frame_id}))
    }

    async fn end_acquisition(&mut self) -> Result<(), CanonicalError> {
        self.check_open()?;
        self.acquiring = false;
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            info!("Released {} after {} frames", self.model(), self.frame_id);
        }
        self.acquiring = false;
        self.released = true;
    }
}

/// We arrange to release the camera when the SimulatedCamera object goes out
/// of scope.
impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced() -> SimulatedCamera {
        SimulatedCamera::new(32, 24).unwrap().with_pacing(false)
    }

    async fn complete(camera: &mut SimulatedCamera) -> Frame {
        match camera.next_frame(Duration::from_millis(1000)).await.unwrap() {
            FrameDelivery::Complete(frame) => frame,
            FrameDelivery::Incomplete => panic!("incomplete frame"),
        }
    }

    #[tokio::test]
    async fn not_streaming_is_an_error() {
        let mut camera = unpaced();
        assert!(camera.next_frame(Duration::from_millis(10)).await.is_err());
        // Continuous mode is required first.
        assert!(camera.begin_acquisition().is_err());
        camera.set_continuous_acquisition().unwrap();
        camera.begin_acquisition().unwrap();
        assert!(camera.next_frame(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn brightness_follows_exposure() {
        let mut camera = unpaced();
        camera.set_continuous_acquisition().unwrap();
        camera.begin_acquisition().unwrap();
        camera.set_exposure(500.0).unwrap();
        let dark = complete(&mut camera).await;
        camera.set_exposure(5000.0).unwrap();
        let bright = complete(&mut camera).await;
        let center = |f: &Frame| f.image.get_pixel(16, 12).0[0];
        assert!(center(&bright) > center(&dark));
        assert_eq!(bright.exposure_us, 5000.0);
        assert_eq!(bright.frame_id, dark.frame_id + 1);
        // Falloff toward the corners.
        assert!(bright.image.get_pixel(0, 0).0[0] < center(&bright));
    }

    #[test]
    fn exposure_is_clamped_to_bounds() {
        let mut camera = unpaced().with_bounds(
            ExposureBounds{min_us: 20.0, max_us: 1000.0}).unwrap();
        assert_eq!(camera.set_exposure(5000.0).unwrap(), 1000.0);
        assert_eq!(camera.set_exposure(1.0).unwrap(), 20.0);
        assert!(camera.set_exposure(0.0).is_err());
        assert!(!camera.auto_exposure());
        camera.restore_auto_exposure().unwrap();
        assert!(camera.auto_exposure());
        assert!(unpaced().with_bounds(ExposureBounds{min_us: 0.0, max_us: 10.0}).is_err());
    }

    #[tokio::test]
    async fn every_nth_delivery_is_incomplete() {
        let mut camera = unpaced().with_incomplete_every(3);
        camera.set_continuous_acquisition().unwrap();
        camera.begin_acquisition().unwrap();
        let mut incomplete = 0;
        for _ in 0..9 {
            if let FrameDelivery::Incomplete =
                camera.next_frame(Duration::from_millis(10)).await.unwrap() {
                incomplete += 1;
            }
        }
        assert_eq!(incomplete, 3);
    }

    #[tokio::test]
    async fn exposure_longer_than_timeout_is_incomplete() {
        let mut camera = SimulatedCamera::new(8, 8).unwrap();
        camera.set_continuous_acquisition().unwrap();
        camera.set_exposure(51200.0).unwrap();
        camera.begin_acquisition().unwrap();
        let delivery = camera.next_frame(Duration::from_millis(5)).await.unwrap();
        assert!(matches!(delivery, FrameDelivery::Incomplete));
    }

    #[test]
    fn released_camera_rejects_calls() {
        let mut camera = unpaced();
        camera.release();
        assert!(camera.get_exposure().is_err());
        assert!(camera.set_continuous_acquisition().is_err());
    }
}
