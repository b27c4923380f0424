// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::consts::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::protocol::Progress;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub type TaskId = String;

/// Called on the pool's runtime for every progress report of a task.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Per-call options for `WorkerPool::execute`.
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Overrides the pool's default timeout. Covers time spent queued as well as executing.
    pub timeout: Option<Duration>,
    /// 0 (lowest) to 10 (highest). Values above 10 are clamped.
    pub priority: Option<u8>,
    pub signal: Option<CancellationToken>,
    pub on_progress: Option<ProgressCallback>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY).min(MAX_PRIORITY)
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("cancellable", &self.signal.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// A task waiting in the pool queue.
#[derive(Debug)]
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub function_name: String,
    pub input: Value,
    pub priority: u8,
    /// Submission order, used to keep equal priorities first-in first-out.
    pub sequence: u64,
    pub created_at: Instant,
}
