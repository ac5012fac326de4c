// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod acquisition_session;
pub mod dataset_layout;
pub mod exposure_planner;
pub mod frame_source;
pub mod frame_stats;
pub mod metadata_log;
pub mod simulated_camera;
pub mod strategy_args;
