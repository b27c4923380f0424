// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// These are programmer errors and are returned synchronously, before any task is scheduled.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The YAML document could not be parsed.
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The TOML document could not be parsed.
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// The file extension does not map to a known format.
    #[error("Unsupported config format '{extension}' (expected .yaml, .yml or .toml)")]
    UnsupportedFormat { extension: String },

    /// A value is out of range or inconsistent with another value.
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// Two pipeline stages share an id.
    #[error("Duplicate stage ID: '{stage_id}'")]
    DuplicateStageId { stage_id: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
