// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod loader;
mod options;

pub mod consts;

pub use loader::{load_and_validate_config, load_config, OffloadConfig};
pub use options::{
    default_max_workers, BatchConfig, PipelineConfig, PoolConfig, RemoteDependency,
    StageDefinition,
};
