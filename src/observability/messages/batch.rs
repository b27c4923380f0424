// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for parallel batch runs.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::Span;

/// A batch run started.
///
/// # Log Level
/// `info!` - Important operational event
///
/// # Example
/// ```
/// use the_offload::observability::messages::batch::BatchStarted;
///
/// let msg = BatchStarted {
///     function_name: "square",
///     items: 4,
///     concurrency: 2,
/// };
///
/// assert_eq!(msg.to_string(), "Batch of 4 item(s) started on 'square' (2 per window)");
/// ```
pub struct BatchStarted<'a> {
    pub function_name: &'a str,
    pub items: usize,
    pub concurrency: usize,
}

impl Display for BatchStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Batch of {} item(s) started on '{}' ({} per window)",
            self.items, self.function_name, self.concurrency
        )
    }
}

impl StructuredLog for BatchStarted<'_> {
    fn log(&self) {
        tracing::info!(
            function_name = self.function_name,
            items = self.items,
            concurrency = self.concurrency,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "batch_run",
            span_name = name,
            function_name = self.function_name,
            items = self.items,
        )
    }
}

/// One concurrency window drained.
///
/// # Log Level
/// `debug!` - Detailed progress information
pub struct WindowDrained {
    pub window: usize,
    pub completed: usize,
    pub total: usize,
}

impl Display for WindowDrained {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Batch window {} drained: {}/{} items done", self.window, self.completed, self.total)
    }
}

impl StructuredLog for WindowDrained {
    fn log(&self) {
        tracing::debug!(
            window = self.window,
            completed = self.completed,
            total = self.total,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("batch_window", span_name = name, window = self.window)
    }
}

/// A batch run ended, either after the last window or on cancellation.
///
/// # Log Level
/// `info!` - Important operational event
pub struct BatchFinished<'a> {
    pub function_name: &'a str,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub duration: Duration,
}

impl Display for BatchFinished<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Batch on '{}' {}: {} succeeded, {} failed in {:?}",
            self.function_name,
            if self.cancelled { "cancelled" } else { "finished" },
            self.succeeded,
            self.failed,
            self.duration
        )
    }
}

impl StructuredLog for BatchFinished<'_> {
    fn log(&self) {
        tracing::info!(
            function_name = self.function_name,
            succeeded = self.succeeded,
            failed = self.failed,
            cancelled = self.cancelled,
            duration_ms = self.duration.as_millis() as u64,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("batch_finished", span_name = name, function_name = self.function_name)
    }
}
