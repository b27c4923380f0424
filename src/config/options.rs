// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::consts::{
    DEFAULT_ABANDONED_TASK_GRACE_MS, DEFAULT_INITIAL_WORKERS, DEFAULT_SHARED_MEMORY_BYTES,
    DEFAULT_TIMEOUT_MS, FALLBACK_MAX_WORKERS, MAX_PRIORITY,
};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Get the default context cap based on system capabilities
///
/// Returns the number of available CPU cores, falling back to 4 if detection fails.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_MAX_WORKERS)
}

/// Worker pool configuration.
///
/// Every field has a default, so an empty `pool:` section (or `PoolConfig::default()`) is valid.
///
/// # Example
/// ```yaml
/// pool:
///   max_workers: 4
///   timeout_ms: 30000
///   abandoned_task_grace_ms: 5000
///   remote_dependencies:
///     - source: deps/math.wasm
///       global_name: math
///   remote_dependency_names:
///     deps/math.wasm: m
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Cap on isolation contexts.
    pub max_workers: usize,
    /// Contexts brought up by `initialize()`; defaults to `min(2, max_workers)`.
    pub initial_workers: Option<usize>,
    /// Default per-task deadline in milliseconds.
    pub timeout_ms: u64,
    /// How long a timed-out or cancelled task may hold its context before the context is replaced.
    /// `None` means wait for the late reply forever.
    pub abandoned_task_grace_ms: Option<u64>,
    /// Hand every context a shared memory region.
    pub use_shared_memory: bool,
    /// Size of the shared memory region.
    pub shared_memory_bytes: usize,
    /// Libraries loaded into every context at creation, in order.
    pub remote_dependencies: Vec<RemoteDependency>,
    /// Dependency source -> alternate name the dependency is also bound under.
    pub remote_dependency_names: HashMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            initial_workers: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            abandoned_task_grace_ms: Some(DEFAULT_ABANDONED_TASK_GRACE_MS),
            use_shared_memory: false,
            shared_memory_bytes: DEFAULT_SHARED_MEMORY_BYTES,
            remote_dependencies: Vec::new(),
            remote_dependency_names: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_initial_workers(mut self, initial_workers: usize) -> Self {
        self.initial_workers = Some(initial_workers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_abandoned_task_grace(mut self, grace: Option<Duration>) -> Self {
        self.abandoned_task_grace_ms = grace.map(|g| g.as_millis() as u64);
        self
    }

    pub fn with_shared_memory(mut self, bytes: usize) -> Self {
        self.use_shared_memory = true;
        self.shared_memory_bytes = bytes;
        self
    }

    pub fn with_dependency(mut self, dependency: RemoteDependency) -> Self {
        self.remote_dependencies.push(dependency);
        self
    }

    pub fn with_dependency_alias(mut self, source: impl Into<String>, alias: impl Into<String>) -> Self {
        self.remote_dependency_names.insert(source.into(), alias.into());
        self
    }

    /// Default deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn abandoned_task_grace(&self) -> Option<Duration> {
        self.abandoned_task_grace_ms.map(Duration::from_millis)
    }

    /// Contexts `initialize()` brings up, never more than `max_workers`.
    pub fn initial_workers(&self) -> usize {
        self.initial_workers
            .unwrap_or(DEFAULT_INITIAL_WORKERS)
            .min(self.max_workers)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("pool.max_workers", "must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("pool.timeout_ms", "must be greater than 0"));
        }
        if let Some(initial) = self.initial_workers {
            if initial > self.max_workers {
                return Err(ConfigError::invalid(
                    "pool.initial_workers",
                    format!("{} exceeds max_workers {}", initial, self.max_workers),
                ));
            }
        }
        if self.use_shared_memory && self.shared_memory_bytes == 0 {
            return Err(ConfigError::invalid(
                "pool.shared_memory_bytes",
                "must be greater than 0 when shared memory is enabled",
            ));
        }

        let mut names = HashSet::new();
        for dependency in &self.remote_dependencies {
            if dependency.source.is_empty() {
                return Err(ConfigError::invalid("pool.remote_dependencies", "source must not be empty"));
            }
            if !names.insert(dependency.global_name()) {
                return Err(ConfigError::invalid(
                    "pool.remote_dependencies",
                    format!("global name '{}' is declared twice", dependency.global_name()),
                ));
            }
        }
        Ok(())
    }
}

/// A library every context loads before its functions become callable.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteDependency {
    /// Path of the WASM binary.
    pub source: String,
    /// Name the dependency is bound under inside a context. Defaults to the file stem.
    #[serde(default)]
    pub global_name: Option<String>,
}

impl RemoteDependency {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            global_name: None,
        }
    }

    pub fn named(mut self, global_name: impl Into<String>) -> Self {
        self.global_name = Some(global_name.into());
        self
    }

    pub fn global_name(&self) -> String {
        match &self.global_name {
            Some(name) => name.clone(),
            None => std::path::Path::new(&self.source)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| self.source.clone()),
        }
    }
}

/// Pipeline definition loadable from configuration.
///
/// Input/output transforms and skip predicates are code, so they are attached to the stages built
/// from these definitions with the `StageConfig` builder.
///
/// # Example
/// ```yaml
/// pipeline:
///   name: numbers
///   stop_on_error: true
///   stages:
///     - id: inc
///       function: add_one
///       max_retries: 2
///       retry_delay_ms: 100
///     - id: dbl
///       function: double
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
    pub stages: Vec<StageDefinition>,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_stop_on_error() -> bool {
    true
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for stage in &self.stages {
            if !ids.insert(stage.id.as_str()) {
                return Err(ConfigError::DuplicateStageId {
                    stage_id: stage.id.clone(),
                });
            }
            if stage.function.is_empty() {
                return Err(ConfigError::invalid(
                    format!("pipeline.stages.{}.function", stage.id),
                    "must not be empty",
                ));
            }
            if let Some(priority) = stage.priority {
                if priority > MAX_PRIORITY {
                    return Err(ConfigError::invalid(
                        format!("pipeline.stages.{}.priority", stage.id),
                        format!("{} is above the maximum of {}", priority, MAX_PRIORITY),
                    ));
                }
            }
            if stage.timeout_ms == Some(0) {
                return Err(ConfigError::invalid(
                    format!("pipeline.stages.{}.timeout_ms", stage.id),
                    "must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

/// One stage as written in a config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub function: String,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<u8>,
}

/// Batch runner defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub function: Option<String>,
    /// Items dispatched per window; `None` runs every item at once.
    pub concurrency: Option<usize>,
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::invalid("batch.concurrency", "must be at least 1"));
        }
        Ok(())
    }
}
