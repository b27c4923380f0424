// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for pipeline run and stage events.

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::Span;

/// A pipeline run started.
///
/// # Log Level
/// `info!` - Important operational event
///
/// # Example
/// ```
/// use the_offload::observability::messages::pipeline::RunStarted;
///
/// let msg = RunStarted {
///     pipeline: "numbers",
///     run_id: 1,
///     stage_count: 3,
///     start_index: 0,
/// };
///
/// assert_eq!(msg.to_string(), "Pipeline 'numbers' run 1 started: 3 stages");
/// ```
pub struct RunStarted<'a> {
    pub pipeline: &'a str,
    pub run_id: u64,
    pub stage_count: usize,
    pub start_index: usize,
}

impl Display for RunStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Pipeline '{}' run {} started: {} stages",
            self.pipeline, self.run_id, self.stage_count
        )?;
        if self.start_index > 0 {
            write!(f, " (resuming at stage {})", self.start_index)?;
        }
        Ok(())
    }
}

impl StructuredLog for RunStarted<'_> {
    fn log(&self) {
        tracing::info!(
            pipeline = self.pipeline,
            run_id = self.run_id,
            stage_count = self.stage_count,
            start_index = self.start_index,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "pipeline_run",
            span_name = name,
            pipeline = self.pipeline,
            run_id = self.run_id,
        )
    }
}

/// A pipeline run reached a terminal state.
///
/// # Log Level
/// `info!` - Important operational event
pub struct RunFinished<'a> {
    pub pipeline: &'a str,
    pub run_id: u64,
    pub status: &'a str,
    pub duration: Duration,
}

impl Display for RunFinished<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Pipeline '{}' run {} {} in {:?}",
            self.pipeline, self.run_id, self.status, self.duration
        )
    }
}

impl StructuredLog for RunFinished<'_> {
    fn log(&self) {
        tracing::info!(
            pipeline = self.pipeline,
            run_id = self.run_id,
            status = self.status,
            duration_ms = self.duration.as_millis() as u64,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "pipeline_finished",
            span_name = name,
            pipeline = self.pipeline,
            status = self.status,
        )
    }
}

/// A stage attempt failed and will be retried.
///
/// # Log Level
/// `warn!` - Recoverable failure
pub struct StageRetrying<'a> {
    pub stage_id: &'a str,
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: &'a dyn std::error::Error,
}

impl Display for StageRetrying<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Stage '{}' failed ({}), retry {}/{} in {:?}",
            self.stage_id, self.error, self.attempt, self.max_retries, self.delay
        )
    }
}

impl StructuredLog for StageRetrying<'_> {
    fn log(&self) {
        tracing::warn!(
            stage_id = self.stage_id,
            attempt = self.attempt,
            max_retries = self.max_retries,
            error = %self.error,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "stage_retrying",
            span_name = name,
            stage_id = self.stage_id,
            attempt = self.attempt,
        )
    }
}

/// A stage exhausted its retries.
///
/// # Log Level
/// `error!` - Failure requiring attention
pub struct StageFailed<'a> {
    pub stage_id: &'a str,
    pub attempts: u32,
    pub stop_on_error: bool,
    pub error: &'a dyn std::error::Error,
}

impl Display for StageFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Stage '{}' failed after {} attempt(s): {}",
            self.stage_id, self.attempts, self.error
        )?;
        if !self.stop_on_error {
            write!(f, " (continuing)")?;
        }
        Ok(())
    }
}

impl StructuredLog for StageFailed<'_> {
    fn log(&self) {
        tracing::error!(
            stage_id = self.stage_id,
            attempts = self.attempts,
            stop_on_error = self.stop_on_error,
            error = %self.error,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::error_span!(
            "stage_failed",
            span_name = name,
            stage_id = self.stage_id,
            error = %self.error,
        )
    }
}

/// A stage was skipped by its predicate.
///
/// # Log Level
/// `debug!` - Routine event
pub struct StageSkipped<'a> {
    pub stage_id: &'a str,
}

impl Display for StageSkipped<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Stage '{}' skipped", self.stage_id)
    }
}

impl StructuredLog for StageSkipped<'_> {
    fn log(&self) {
        tracing::debug!(stage_id = self.stage_id, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("stage_skipped", span_name = name, stage_id = self.stage_id)
    }
}
