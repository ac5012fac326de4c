// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::{Args, ValueEnum};

use crate::exposure_planner::{DEFAULT_INCREMENT_US, DEFAULT_REFERENCE_RATIO,
                              DEFAULT_REFERENCE_START_US, PlanStrategy};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StrategyKind {
    Geometric,
    Linear,
    ReferenceMerge,
}

/// Command line options selecting and tuning the exposure planner. Shared by
/// the binaries.
#[derive(Args, Debug)]
pub struct StrategyArgs {
    /// How the response sweep's exposures are chosen.
    #[arg(long, value_enum, default_value_t = StrategyKind::Geometric)]
    pub strategy: StrategyKind,

    /// Number of geometric steps; the sweep has one more exposure than this.
    #[arg(long, default_value_t = 120)]
    pub samples: usize,

    /// Step of the device's additive exposure grid, in microseconds.
    #[arg(long, default_value_t = DEFAULT_INCREMENT_US)]
    pub increment_us: f64,

    /// First exposure of the reference grid, in microseconds.
    #[arg(long, default_value_t = DEFAULT_REFERENCE_START_US)]
    pub reference_start_us: f64,

    /// Ratio between consecutive reference grid exposures.
    #[arg(long, default_value_t = DEFAULT_REFERENCE_RATIO)]
    pub reference_ratio: f64,
}

impl StrategyArgs {
    pub fn strategy(&self) -> PlanStrategy {
        match self.strategy {
            StrategyKind::Geometric => PlanStrategy::Geometric,
            StrategyKind::Linear =>
                PlanStrategy::LinearAdditive { increment_us: self.increment_us },
            StrategyKind::ReferenceMerge => PlanStrategy::ReferenceMerge {
                reference_start_us: self.reference_start_us,
                reference_ratio: self.reference_ratio,
                increment_us: self.increment_us,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        plan: StrategyArgs,
    }

    #[test]
    fn defaults_to_geometric() {
        let cli = Cli::parse_from(["test"]);
        assert_eq!(cli.plan.strategy(), PlanStrategy::Geometric);
        assert_eq!(cli.plan.samples, 120);
    }

    #[test]
    fn reference_merge_options() {
        let cli = Cli::parse_from(["test", "--strategy", "reference-merge",
                                   "--reference-ratio", "1.1", "--increment-us", "5"]);
        assert_eq!(cli.plan.strategy(), PlanStrategy::ReferenceMerge {
            reference_start_us: 50.0, reference_ratio: 1.1, increment_us: 5.0 });
    }
}
