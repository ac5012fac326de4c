// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Builds the sequence of exposure values swept through when collecting a
//! response dataset.

use std::fmt;

use canonical_error::{CanonicalError, invalid_argument_error};

/// Additive step of the device's own exposure grid, in microseconds.
pub const DEFAULT_INCREMENT_US: f64 = 10.0;

/// The reference grid approximates the exposures of the TUM monoVO
/// photometric calibration sequences.
pub const DEFAULT_REFERENCE_START_US: f64 = 50.0;
pub const DEFAULT_REFERENCE_RATIO: f64 = 1.05;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum PlanStrategy {
    /// `min, min + increment, min + 2*increment, ...` up to `max`.
    LinearAdditive { increment_us: f64 },

    /// `sample_count + 1` values from `min` to `max` with equal log spacing.
    #[default]
    Geometric,

    /// A geometric reference grid (`start * ratio^k`, k >= 1) merged onto the
    /// device's additive grid: each reference value picks the grid step just
    /// below it, and each grid step is used at most once.
    ReferenceMerge {
        reference_start_us: f64,
        reference_ratio: f64,
        increment_us: f64,
    },
}

impl PlanStrategy {
    pub fn linear() -> Self {
        PlanStrategy::LinearAdditive { increment_us: DEFAULT_INCREMENT_US }
    }

    pub fn reference_merge() -> Self {
        PlanStrategy::ReferenceMerge {
            reference_start_us: DEFAULT_REFERENCE_START_US,
            reference_ratio: DEFAULT_REFERENCE_RATIO,
            increment_us: DEFAULT_INCREMENT_US,
        }
    }
}

/// Ordered exposure values, in microseconds, each within the bounds the plan
/// was built for.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposurePlan {
    values: Vec<f64>,
}

impl ExposurePlan {
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }
}

impl fmt::Display for ExposurePlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.values.first(), self.values.last()) {
            (Some(first), Some(last)) =>
                write!(f, "{} exposures from {:.3}us to {:.3}us",
                       self.values.len(), first, last),
            _ => write!(f, "empty plan"),
        }
    }
}

/// Plans the exposures for a response sweep between `exposure_min` and
/// `exposure_max` (microseconds).
///
/// Returns InvalidArgument when the bounds are not usable: `exposure_min`
/// must be finite and positive, `exposure_max` finite, and `sample_count`
/// non-zero. An inverted or empty range (`exposure_max <= exposure_min`)
/// yields the single exposure `exposure_min`.
pub fn plan(exposure_min: f64, exposure_max: f64, sample_count: usize,
            strategy: &PlanStrategy) -> Result<ExposurePlan, CanonicalError> {
    if !exposure_min.is_finite() || exposure_min <= 0.0 {
        return Err(invalid_argument_error(
            format!("exposure_min must be positive, got {}", exposure_min).as_str()));
    }
    if !exposure_max.is_finite() {
        return Err(invalid_argument_error(
            format!("exposure_max must be finite, got {}", exposure_max).as_str()));
    }
    if sample_count == 0 {
        return Err(invalid_argument_error("sample_count must be positive"));
    }
    if exposure_max <= exposure_min {
        return Ok(ExposurePlan{values: vec![exposure_min]});
    }
    let values = match *strategy {
        PlanStrategy::LinearAdditive { increment_us } => {
            check_increment(increment_us)?;
            additive_grid(exposure_min, exposure_max, increment_us)
        },
        PlanStrategy::Geometric => {
            geometric(exposure_min, exposure_max, sample_count)
        },
        PlanStrategy::ReferenceMerge { reference_start_us, reference_ratio,
                                       increment_us } => {
            check_increment(increment_us)?;
            if !reference_start_us.is_finite() || reference_start_us <= 0.0 {
                return Err(invalid_argument_error(
                    format!("reference_start_us must be positive, got {}",
                            reference_start_us).as_str()));
            }
            if !reference_ratio.is_finite() || reference_ratio <= 1.0 {
                return Err(invalid_argument_error(
                    format!("reference_ratio must exceed 1, got {}",
                            reference_ratio).as_str()));
            }
            reference_merge(exposure_min, exposure_max, increment_us,
                            reference_start_us, reference_ratio)
        },
    };
    Ok(ExposurePlan{values})
}

fn check_increment(increment_us: f64) -> Result<(), CanonicalError> {
    if !increment_us.is_finite() || increment_us <= 0.0 {
        return Err(invalid_argument_error(
            format!("increment_us must be positive, got {}", increment_us).as_str()));
    }
    Ok(())
}

// Each value is computed from its step count rather than by accumulation, so
// long grids do not drift.
fn additive_grid(min: f64, max: f64, increment: f64) -> Vec<f64> {
    let steps = ((max - min) / increment).floor() as usize;
    (0..=steps)
        .map(|k| min + k as f64 * increment)
        .filter(|v| *v <= max)
        .collect()
}

fn geometric(min: f64, max: f64, sample_count: usize) -> Vec<f64> {
    let ratio = (max / min).powf(1.0 / sample_count as f64);
    let mut values = Vec::with_capacity(sample_count + 1);
    for i in 0..=sample_count {
        values.push((min * ratio.powi(i as i32)).min(max));
    }
    values
}

fn reference_merge(min: f64, max: f64, increment: f64,
                   reference_start: f64, reference_ratio: f64) -> Vec<f64> {
    // Device grid: min + increment, min + 2*increment, ... up to the first
    // step at or past max.
    let mut grid = Vec::new();
    let mut k = 0.0;
    while min + k * increment < max {
        k += 1.0;
        grid.push(min + k * increment);
    }
    let mut reference = Vec::new();
    let mut r = reference_start;
    while r < max {
        r *= reference_ratio;
        reference.push(r);
    }

    let mut values = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < reference.len() && j < grid.len() {
        // Reference values below the current grid step share its cell.
        while i < reference.len() && reference[i] < grid[j] {
            i += 1;
        }
        if i == reference.len() {
            break;
        }
        while j < grid.len() && grid[j] < reference[i] {
            j += 1;
        }
        let below = if j == 0 { min } else { grid[j - 1] };
        values.push(below.min(max));
        i += 1;
    }
    if values.is_empty() {
        // The whole reference grid lies above the device range.
        values.push(min);
    }
    values
}
