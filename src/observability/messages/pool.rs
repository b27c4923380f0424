// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for worker pool events.
//!
//! This module contains message types for logging events related to:
//! * Isolation context lifecycle (spawn, ready, fault, retirement)
//! * Task scheduling (dispatch, completion, failure, abandonment)
//! * Registry rebuilds and pool termination

use crate::observability::messages::StructuredLog;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::Span;

/// A new isolation context was spawned.
///
/// # Log Level
/// `debug!` - Routine lifecycle event
pub struct ContextSpawned {
    pub context_id: u32,
    pub generation: u64,
    pub function_count: usize,
}

impl Display for ContextSpawned {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Spawned isolation context {} (registry generation {}, {} functions)",
            self.context_id, self.generation, self.function_count
        )
    }
}

impl StructuredLog for ContextSpawned {
    fn log(&self) {
        tracing::debug!(
            context_id = self.context_id,
            generation = self.generation,
            function_count = self.function_count,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "context_spawned",
            span_name = name,
            context_id = self.context_id,
            generation = self.generation,
        )
    }
}

/// An isolation context finished bootstrapping and can take work.
///
/// # Log Level
/// `debug!` - Routine lifecycle event
pub struct ContextReady<'a> {
    pub context_id: u32,
    pub functions: &'a [String],
}

impl Display for ContextReady<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Isolation context {} ready with functions [{}]",
            self.context_id,
            self.functions.join(", ")
        )
    }
}

impl StructuredLog for ContextReady<'_> {
    fn log(&self) {
        tracing::debug!(
            context_id = self.context_id,
            function_count = self.functions.len(),
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("context_ready", span_name = name, context_id = self.context_id)
    }
}

/// An isolation context died outside the reply protocol.
///
/// # Log Level
/// `warn!` - The pool recovers by replacing the context
pub struct ContextFaulted<'a> {
    pub context_id: u32,
    pub task_id: Option<&'a str>,
    pub reason: &'a str,
}

impl Display for ContextFaulted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self.task_id {
            Some(task_id) => write!(
                f,
                "Isolation context {} failed while running task {}: {}",
                self.context_id, task_id, self.reason
            ),
            None => write!(f, "Isolation context {} failed: {}", self.context_id, self.reason),
        }
    }
}

impl StructuredLog for ContextFaulted<'_> {
    fn log(&self) {
        tracing::warn!(
            context_id = self.context_id,
            task_id = self.task_id,
            reason = self.reason,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "context_faulted",
            span_name = name,
            context_id = self.context_id,
            reason = self.reason,
        )
    }
}

/// An isolation context was shut down on purpose.
///
/// # Log Level
/// `debug!` - Routine lifecycle event
pub struct ContextRetired<'a> {
    pub context_id: u32,
    pub reason: &'a str,
}

impl Display for ContextRetired<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Retired isolation context {}: {}", self.context_id, self.reason)
    }
}

impl StructuredLog for ContextRetired<'_> {
    fn log(&self) {
        tracing::debug!(context_id = self.context_id, reason = self.reason, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("context_retired", span_name = name, context_id = self.context_id)
    }
}

/// A queued task was handed to a context.
///
/// # Log Level
/// `debug!` - High-volume scheduling event
pub struct TaskDispatched<'a> {
    pub task_id: &'a str,
    pub function_name: &'a str,
    pub context_id: u32,
    pub priority: u8,
    pub buffers: usize,
}

impl Display for TaskDispatched<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Dispatched task {} ({}) to context {} at priority {}",
            self.task_id, self.function_name, self.context_id, self.priority
        )?;
        if self.buffers > 0 {
            write!(f, ", moving {} buffer(s)", self.buffers)?;
        }
        Ok(())
    }
}

impl StructuredLog for TaskDispatched<'_> {
    fn log(&self) {
        tracing::debug!(
            task_id = self.task_id,
            function_name = self.function_name,
            context_id = self.context_id,
            priority = self.priority,
            buffers = self.buffers,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "task",
            span_name = name,
            task_id = self.task_id,
            function_name = self.function_name,
            context_id = self.context_id,
        )
    }
}

/// A task finished with a result.
///
/// # Log Level
/// `debug!` - High-volume scheduling event
pub struct TaskCompleted<'a> {
    pub task_id: &'a str,
    pub function_name: &'a str,
    pub duration: Duration,
    pub output_size: Option<usize>,
}

impl Display for TaskCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Task {} ({}) completed in {:?}",
            self.task_id, self.function_name, self.duration
        )
    }
}

impl StructuredLog for TaskCompleted<'_> {
    fn log(&self) {
        tracing::debug!(
            task_id = self.task_id,
            function_name = self.function_name,
            duration_ms = self.duration.as_millis() as u64,
            output_size = self.output_size,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "task_completed",
            span_name = name,
            task_id = self.task_id,
            duration = ?self.duration,
        )
    }
}

/// A task failed, timed out, or hit a context fault.
///
/// # Log Level
/// `warn!` - The failure is reported to the caller, the pool carries on
pub struct TaskFailed<'a> {
    pub task_id: &'a str,
    pub function_name: &'a str,
    pub error: &'a dyn std::error::Error,
}

impl Display for TaskFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Task {} ({}) failed: {}",
            self.task_id, self.function_name, self.error
        )
    }
}

impl StructuredLog for TaskFailed<'_> {
    fn log(&self) {
        tracing::warn!(
            task_id = self.task_id,
            function_name = self.function_name,
            error = %self.error,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "task_failed",
            span_name = name,
            task_id = self.task_id,
            error = %self.error,
        )
    }
}

/// The caller stopped waiting for a dispatched task; its late reply will be dropped.
///
/// # Log Level
/// `debug!` - Expected on timeouts and cancellations
pub struct TaskAbandoned<'a> {
    pub task_id: &'a str,
    pub context_id: u32,
    pub reason: &'a str,
}

impl Display for TaskAbandoned<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Abandoned task {} on context {} ({}); late reply will be discarded",
            self.task_id, self.context_id, self.reason
        )
    }
}

impl StructuredLog for TaskAbandoned<'_> {
    fn log(&self) {
        tracing::debug!(
            task_id = self.task_id,
            context_id = self.context_id,
            reason = self.reason,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!("task_abandoned", span_name = name, task_id = self.task_id)
    }
}

/// The function registry changed and contexts are being rebuilt.
///
/// # Log Level
/// `info!` - Important operational event
pub struct RegistryRebuilt<'a> {
    pub function_name: &'a str,
    pub generation: u64,
    pub replaced: usize,
    pub retiring: usize,
}

impl Display for RegistryRebuilt<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Registry changed ('{}'), generation {}: replacing {} idle context(s), retiring {} busy context(s)",
            self.function_name, self.generation, self.replaced, self.retiring
        )
    }
}

impl StructuredLog for RegistryRebuilt<'_> {
    fn log(&self) {
        tracing::info!(
            function_name = self.function_name,
            generation = self.generation,
            replaced = self.replaced,
            retiring = self.retiring,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("registry_rebuilt", span_name = name, generation = self.generation)
    }
}

/// The pool was terminated.
///
/// # Log Level
/// `info!` - Important operational event
pub struct PoolTerminated {
    pub contexts: usize,
    pub rejected_tasks: usize,
}

impl Display for PoolTerminated {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker pool terminated: {} context(s) stopped, {} task(s) rejected",
            self.contexts, self.rejected_tasks
        )
    }
}

impl StructuredLog for PoolTerminated {
    fn log(&self) {
        tracing::info!(
            contexts = self.contexts,
            rejected_tasks = self.rejected_tasks,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!("pool_terminated", span_name = name, contexts = self.contexts)
    }
}
