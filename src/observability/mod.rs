// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! This module provides centralized message types for all diagnostic and operational
//! logging throughout the crate. Message types follow a struct-based pattern
//! with `Display` trait implementation to:
//!
//! * Eliminate magic strings scattered throughout the codebase
//! * Keep field names consistent between the human-readable line and the structured fields
//! * Provide consistent, structured logging output
//!
//! # Architecture
//!
//! Messages are organized by subsystem:
//! * `messages::pool` - isolation context lifecycle and task scheduling events
//! * `messages::pipeline` - pipeline run and stage events
//! * `messages::batch` - parallel batch runs
//! * `messages::wasm` - WASM module loading and caching events
//!
//! # Usage
//!
//! ```rust
//! use the_offload::observability::messages::pool::TaskDispatched;
//! use the_offload::observability::messages::StructuredLog;
//!
//! TaskDispatched {
//!     task_id: "task-1",
//!     function_name: "double",
//!     context_id: 0,
//!     priority: 5,
//!     buffers: 0,
//! }
//! .log();
//! ```

pub mod messages;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Only binaries should call this; the library never installs a subscriber itself. Calling it twice
/// is harmless, the second call is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
