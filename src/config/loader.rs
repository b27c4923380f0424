// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::{BatchConfig, PipelineConfig, PoolConfig};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration file.
///
/// # Example
/// ```yaml
/// pool:
///   max_workers: 2
/// pipeline:
///   stages:
///     - id: inc
///       function: add_one
/// batch:
///   function: square
///   concurrency: 2
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OffloadConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        if let Some(pipeline) = &self.pipeline {
            pipeline.validate()?;
        }
        self.batch.validate()
    }
}

/// Load a config from a YAML or TOML file, picked by extension.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OffloadConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        "toml" => Ok(toml::from_str(&content)?),
        _ => Err(ConfigError::UnsupportedFormat { extension }),
    }
}

/// Load a config file and validate it before anything is started.
pub fn load_and_validate_config<P: AsRef<Path>>(path: P) -> Result<OffloadConfig, ConfigError> {
    let cfg = load_config(path)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::consts::DEFAULT_TIMEOUT_MS;
    use std::io::Write;
    use tempfile::Builder;

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parse_basic_yaml_config() {
        let yaml = r#"
pool:
  max_workers: 3
  timeout_ms: 1500
pipeline:
  name: numbers
  stages:
    - id: inc
      function: add_one
      max_retries: 2
      retry_delay_ms: 50
    - id: dbl
      function: double
batch:
  function: square
  concurrency: 2
"#;
        let file = write_temp(".yaml", yaml);
        let cfg = load_and_validate_config(file.path()).unwrap();

        assert_eq!(cfg.pool.max_workers, 3);
        assert_eq!(cfg.pool.timeout_ms, 1500);
        let pipeline = cfg.pipeline.unwrap();
        assert_eq!(pipeline.name, "numbers");
        assert!(pipeline.stop_on_error);
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.stages[0].max_retries, 2);
        assert_eq!(cfg.batch.concurrency, Some(2));
    }

    #[test]
    fn parse_toml_config() {
        let toml = r#"
[pool]
max_workers = 2
use_shared_memory = true

[[pool.remote_dependencies]]
source = "deps/math.wasm"

[pool.remote_dependency_names]
"deps/math.wasm" = "m"
"#;
        let file = write_temp(".toml", toml);
        let cfg = load_and_validate_config(file.path()).unwrap();

        assert_eq!(cfg.pool.max_workers, 2);
        assert!(cfg.pool.use_shared_memory);
        assert_eq!(cfg.pool.remote_dependencies[0].global_name(), "math");
        assert_eq!(cfg.pool.remote_dependency_names.get("deps/math.wasm").unwrap(), "m");
        assert!(cfg.pipeline.is_none());
    }

    #[test]
    fn test_defaults_for_empty_document() {
        let file = write_temp(".yaml", "{}");
        let cfg = load_and_validate_config(file.path()).unwrap();

        assert_eq!(cfg.pool.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(cfg.pool.max_workers >= 1);
        assert!(cfg.pool.initial_workers() <= cfg.pool.max_workers);
        assert_eq!(cfg.pool.abandoned_task_grace_ms, Some(5_000));
    }

    #[test]
    fn test_duplicate_stage_ids_rejected() {
        let yaml = r#"
pipeline:
  stages:
    - id: a
      function: f
    - id: a
      function: g
"#;
        let file = write_temp(".yml", yaml);
        let result = load_and_validate_config(file.path());
        assert!(matches!(result, Err(ConfigError::DuplicateStageId { stage_id }) if stage_id == "a"));
    }

    #[test]
    fn test_invalid_pool_values_rejected() {
        let file = write_temp(".yaml", "pool:\n  max_workers: 0\n");
        let error = load_and_validate_config(file.path()).unwrap_err();
        assert!(error.to_string().contains("max_workers"));

        let file = write_temp(".yaml", "pool:\n  max_workers: 1\n  initial_workers: 4\n");
        assert!(load_and_validate_config(file.path()).is_err());

        let yaml = "pipeline:\n  stages:\n    - id: a\n      function: f\n      priority: 11\n";
        let file = write_temp(".yaml", yaml);
        assert!(load_and_validate_config(file.path()).is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_temp(".json", "{}");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/offload.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
