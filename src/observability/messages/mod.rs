// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging.
//!
//! Each message type implements `Display` for the human-readable line and `StructuredLog` to
//! emit it at its documented level with the same values attached as tracing fields.
//!
//! # Organization
//!
//! * `pool` - isolation context lifecycle and task scheduling events
//! * `batch` - parallel batch runs
//! * `pipeline` - pipeline run and stage events
//! * `wasm` - WASM module loading and caching events

pub mod batch;
pub mod pipeline;
pub mod pool;
pub mod wasm;

use tracing::Span;

/// Emit a message at its documented level, with structured fields.
pub trait StructuredLog {
    /// Log the message as a single event.
    fn log(&self);

    /// Open a span carrying the message's fields.
    fn span(&self, name: &str) -> Span;
}
