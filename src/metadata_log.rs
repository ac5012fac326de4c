// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, failed_precondition_error};
use log::warn;

/// One line of the metadata log; describes one saved frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CaptureRecord {
    /// Contiguous from 0 in capture order; matches the image filename.
    pub frame_index: u64,
    /// Unix time of frame readout, in milliseconds.
    pub capture_time_millis: i64,
    pub exposure_us: f64,
}

impl CaptureRecord {
    /// Formats the record as a metadata log line (without the newline):
    /// `frame_index capture_time_seconds exposure_us`.
    pub fn to_line(&self) -> String {
        format!("{} {}.{:03} {:.3}", self.frame_index,
                self.capture_time_millis.div_euclid(1000),
                self.capture_time_millis.rem_euclid(1000),
                self.exposure_us)
    }
}

/// Destination of capture records. Records are appended in capture order and
/// never revisited.
pub trait MetadataSink {
    fn append(&mut self, record: CaptureRecord) -> Result<(), CanonicalError>;
    fn flush(&mut self) -> Result<(), CanonicalError>;
}

/// In-memory sink.
impl MetadataSink for Vec<CaptureRecord> {
    fn append(&mut self, record: CaptureRecord) -> Result<(), CanonicalError> {
        self.push(record);
        Ok(())
    }
    fn flush(&mut self) -> Result<(), CanonicalError> { Ok(()) }
}

/// An absent sink discards records, for runs without a metadata log.
impl<M: MetadataSink> MetadataSink for Option<M> {
    fn append(&mut self, record: CaptureRecord) -> Result<(), CanonicalError> {
        match self {
            Some(sink) => sink.append(record),
            None => Ok(()),
        }
    }
    fn flush(&mut self) -> Result<(), CanonicalError> {
        match self {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

/// Text file, one CaptureRecord per line, written in capture order.
pub struct MetadataLog {
    path: PathBuf,
    writer: BufWriter<File>,
    lines_written: u64,
}

impl MetadataLog {
    /// Creates `path`, replacing any earlier log there. Frame indices start at
    /// 0 on every run, so lines from a previous run would collide.
    pub fn open(path: &Path) -> Result<Self, CanonicalError> {
        if fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            warn!("Overwriting existing metadata log {:?}", path);
        }
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)
            .map_err(|e| failed_precondition_error(
                format!("Could not open metadata log {:?}: {}", path, e).as_str()))?;
        Ok(MetadataLog{path: path.to_path_buf(),
                       writer: BufWriter::new(file),
                       lines_written: 0})
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }
}

impl MetadataSink for MetadataLog {
    fn append(&mut self, record: CaptureRecord) -> Result<(), CanonicalError> {
        writeln!(self.writer, "{}", record.to_line()).map_err(|e| failed_precondition_error(
            format!("Could not write to {:?}: {}", self.path, e).as_str()))?;
        self.lines_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CanonicalError> {
        self.writer.flush().map_err(|e| failed_precondition_error(
            format!("Could not flush {:?}: {}", self.path, e).as_str()))
    }
}
