// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;

use crate::acquisition_session::DatasetMode;

pub const METADATA_FILE_NAME: &str = "times.txt";
pub const IMAGES_DIR_NAME: &str = "images";

/// Where a run's images and metadata log are written.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetLayout {
    pub dataset_dir: PathBuf,
    pub image_dir: PathBuf,
    pub metadata_path: PathBuf,
}

pub fn dataset_dir_name(mode: DatasetMode) -> &'static str {
    match mode {
        DatasetMode::Vignette => "vignette-dataset",
        DatasetMode::Response => "response-dataset",
    }
}

impl DatasetLayout {
    pub fn new(root: &Path, mode: DatasetMode, images_subdir: bool) -> Self {
        let dataset_dir = root.join(dataset_dir_name(mode));
        let image_dir = if images_subdir {
            dataset_dir.join(IMAGES_DIR_NAME)
        } else {
            dataset_dir.clone()
        };
        let metadata_path = dataset_dir.join(METADATA_FILE_NAME);
        DatasetLayout{dataset_dir, image_dir, metadata_path}
    }

    /// Creates the dataset (and image) directories if absent. Existing
    /// directories are reused.
    pub fn create(&self) -> Result<(), CanonicalError> {
        if !self.image_dir.is_dir() {
            fs::create_dir_all(&self.image_dir).map_err(|e| failed_precondition_error(
                format!("Could not create {:?}: {}", self.image_dir, e).as_str()))?;
            info!("Created {:?}", self.image_dir);
        }
        Ok(())
    }
}

/// Image filename for the `frame_index`th saved frame. The serial number and
/// capture time keep names unique across cameras and runs.
pub fn image_file_name(serial_number: Option<&str>, frame_index: u64,
                       capture_time_millis: i64) -> String {
    match serial_number {
        Some(serial) if !serial.is_empty() =>
            format!("ExposureQS-{}-{}-{}.jpg", serial, frame_index, capture_time_millis),
        _ => format!("ExposureQS-{}-{}.jpg", frame_index, capture_time_millis),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = DatasetLayout::new(Path::new("/data"), DatasetMode::Response, true);
        assert_eq!(layout.dataset_dir, Path::new("/data/response-dataset"));
        assert_eq!(layout.image_dir, Path::new("/data/response-dataset/images"));
        assert_eq!(layout.metadata_path, Path::new("/data/response-dataset/times.txt"));

        let flat = DatasetLayout::new(Path::new("out"), DatasetMode::Vignette, false);
        assert_eq!(flat.image_dir, Path::new("out/vignette-dataset"));
    }

    #[test]
    fn file_names() {
        assert_eq!(image_file_name(Some("15231234"), 3, 1700000000123),
                   "ExposureQS-15231234-3-1700000000123.jpg");
        assert_eq!(image_file_name(None, 0, 5), "ExposureQS-0-5.jpg");
        assert_eq!(image_file_name(Some(""), 0, 5), "ExposureQS-0-5.jpg");
    }

    #[test]
    fn create_is_idempotent() {
        let root = std::env::temp_dir().join(
            format!("dataset_layout_test_{}", std::process::id()));
        let layout = DatasetLayout::new(&root, DatasetMode::Vignette, true);
        layout.create().unwrap();
        layout.create().unwrap();
        assert!(layout.image_dir.is_dir());
        std::fs::remove_dir_all(&root).unwrap();
    }
}
