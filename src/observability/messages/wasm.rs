// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for WASM loading and caching events.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use tracing::Span;

/// WASM module bytes loaded from disk.
///
/// # Log Level
/// `info!` - Important operational event
///
/// # Example
/// ```
/// use the_offload::observability::messages::wasm::ModuleLoaded;
///
/// let msg = ModuleLoaded {
///     module_path: "deps/math.wasm",
///     size_bytes: 4096,
/// };
///
/// assert_eq!(msg.to_string(), "Loaded WASM module: deps/math.wasm (4096 bytes)");
/// ```
pub struct ModuleLoaded<'a> {
    pub module_path: &'a str,
    pub size_bytes: usize,
}

impl Display for ModuleLoaded<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Loaded WASM module: {} ({} bytes)",
            self.module_path, self.size_bytes
        )
    }
}

impl StructuredLog for ModuleLoaded<'_> {
    fn log(&self) {
        tracing::info!(
            module_path = self.module_path,
            size_bytes = self.size_bytes,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("module_loaded", span_name = name, module_path = self.module_path)
    }
}

/// WASM module loading failed.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct ModuleLoadFailed<'a> {
    pub module_path: &'a str,
    pub error: &'a dyn std::error::Error,
}

impl Display for ModuleLoadFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Failed to load WASM module '{}': {}",
            self.module_path, self.error
        )
    }
}

impl StructuredLog for ModuleLoadFailed<'_> {
    fn log(&self) {
        tracing::error!(
            module_path = self.module_path,
            error = %self.error,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!(
            "module_load_failed",
            span_name = name,
            module_path = self.module_path,
            error = %self.error,
        )
    }
}

/// WASM module compiled and added to the cache.
///
/// # Log Level
/// `debug!` - Routine event
pub struct ModuleCompiled<'a> {
    pub module_key: &'a str,
    pub size_bytes: usize,
}

impl Display for ModuleCompiled<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Compiled WASM module '{}' ({} bytes)",
            self.module_key, self.size_bytes
        )
    }
}

impl StructuredLog for ModuleCompiled<'_> {
    fn log(&self) {
        tracing::debug!(
            module_key = self.module_key,
            size_bytes = self.size_bytes,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("module_compiled", span_name = name, module_key = self.module_key)
    }
}

/// A compiled module was served from the cache.
///
/// # Log Level
/// `debug!` - Routine event
pub struct ModuleCacheHit<'a> {
    pub module_key: &'a str,
}

impl Display for ModuleCacheHit<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "WASM module cache hit: {}", self.module_key)
    }
}

impl StructuredLog for ModuleCacheHit<'_> {
    fn log(&self) {
        tracing::debug!(module_key = self.module_key, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("module_cache_hit", span_name = name, module_key = self.module_key)
    }
}
