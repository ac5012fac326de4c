// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use clap::Parser;
use env_logger;
use log::{error, info};

use photometric_capture::exposure_planner::plan;
use photometric_capture::strategy_args::StrategyArgs;

/// Prints the exposures, in microseconds and one per line, that a response
/// dataset collection would sweep through for the given camera bounds.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Camera's minimum exposure in microseconds.
    #[arg(long)]
    min_us: f64,

    /// Camera's maximum exposure in microseconds.
    #[arg(long)]
    max_us: f64,

    #[command(flatten)]
    plan: StrategyArgs,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match plan(args.min_us, args.max_us, args.plan.samples, &args.plan.strategy()) {
        Ok(plan) => {
            info!("{:?} strategy: {}", args.plan.strategy, plan);
            for exposure_us in plan.iter() {
                println!("{:.3}", exposure_us);
            }
        },
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        },
    }
}
