// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::BatchConfig;
use crate::errors::{ConfigError, PoolError};
use crate::observability::messages::batch::{BatchFinished, BatchStarted, WindowDrained};
use crate::observability::messages::StructuredLog;
use crate::pool::{TaskOptions, WorkerPool};
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Outcome of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    /// Position of the item in the submitted list.
    pub index: usize,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<PoolError>,
    pub duration: Duration,
}

/// Aggregate of a batch run. Item failures land in `failed`; the run itself never errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchResult {
    /// Every issued item, in index order.
    pub results: Vec<BatchItemResult>,
    pub successful: Vec<Value>,
    pub failed: Vec<BatchItemResult>,
    pub total_duration: Duration,
    /// Successes over issued items; 0 for an empty batch.
    pub success_rate: f64,
    /// True if `cancel()` fired while the run was active.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

struct BatchShared {
    signal: Mutex<CancellationToken>,
    loading: AtomicBool,
    progress: watch::Sender<BatchProgress>,
}

/// Applies one function to many items through the worker pool.
///
/// Items are split into consecutive windows of `concurrency` items. The items of a window run
/// concurrently and the whole window drains before the next one is issued.
#[derive(Clone)]
pub struct BatchRunner {
    pool: WorkerPool,
    function_name: String,
    concurrency: Option<usize>,
    task_options: TaskOptions,
    shared: Arc<BatchShared>,
}

impl BatchRunner {
    pub fn new(pool: WorkerPool, function_name: impl Into<String>) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            pool,
            function_name: function_name.into(),
            concurrency: None,
            task_options: TaskOptions::default(),
            shared: Arc::new(BatchShared {
                signal: Mutex::new(CancellationToken::new()),
                loading: AtomicBool::new(false),
                progress,
            }),
        }
    }

    /// Build a runner from the `batch` configuration section.
    pub fn from_config(pool: WorkerPool, config: &BatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let function = config
            .function
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("batch.function", "is required to build a runner"))?;
        let runner = Self::new(pool, function);
        Ok(match config.concurrency {
            Some(concurrency) => runner.with_concurrency(concurrency),
            None => runner,
        })
    }

    /// Items per window. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Options applied to every item. A signal given here also cancels the batch.
    pub fn with_task_options(mut self, options: TaskOptions) -> Self {
        self.task_options = options;
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub async fn run(&self, items: Vec<Value>) -> BatchResult {
        let started = Instant::now();
        let total = items.len();
        let window_size = self.concurrency.unwrap_or(total).max(1);
        let signal = self.begin(total);

        BatchStarted {
            function_name: &self.function_name,
            items: total,
            concurrency: window_size.min(total.max(1)),
        }
        .log();

        let mut results = Vec::with_capacity(total);
        let mut cancelled = false;
        let mut queue = items.into_iter().enumerate().peekable();
        let mut window = 0;

        while queue.peek().is_some() {
            if signal.is_cancelled() {
                cancelled = true;
                break;
            }
            let batch: Vec<(usize, Value)> = queue.by_ref().take(window_size).collect();
            let calls = batch
                .into_iter()
                .map(|(index, item)| self.run_item(index, item, &signal));
            results.extend(join_all(calls).await);

            window += 1;
            let completed = results.len();
            self.shared.progress.send_replace(BatchProgress { completed, total });
            WindowDrained {
                window,
                completed,
                total,
            }
            .log();
        }
        cancelled |= signal.is_cancelled();

        let result = aggregate(results, started.elapsed(), cancelled);
        self.shared.loading.store(false, Ordering::SeqCst);
        BatchFinished {
            function_name: &self.function_name,
            succeeded: result.successful.len(),
            failed: result.failed.len(),
            cancelled,
            duration: result.total_duration,
        }
        .log();
        result
    }

    fn begin(&self, total: usize) -> CancellationToken {
        let signal = match &self.task_options.signal {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        *self.shared.signal.lock().unwrap_or_else(PoisonError::into_inner) = signal.clone();
        self.shared.loading.store(true, Ordering::SeqCst);
        self.shared.progress.send_replace(BatchProgress { completed: 0, total });
        signal
    }

    async fn run_item(&self, index: usize, item: Value, signal: &CancellationToken) -> BatchItemResult {
        let started = Instant::now();
        let options = self.task_options.clone().with_signal(signal.clone());
        match self.pool.execute(&self.function_name, item, options).await {
            Ok(data) => BatchItemResult {
                index,
                success: true,
                data: Some(data),
                error: None,
                duration: started.elapsed(),
            },
            Err(error) => BatchItemResult {
                index,
                success: false,
                data: None,
                error: Some(error),
                duration: started.elapsed(),
            },
        }
    }

    /// Stop issuing windows. Items in flight are cancelled, finished items keep their results.
    pub fn cancel(&self) {
        self.shared.signal.lock().unwrap_or_else(PoisonError::into_inner).cancel();
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> BatchProgress {
        *self.shared.progress.borrow()
    }

    /// Progress after each drained window.
    pub fn subscribe_progress(&self) -> watch::Receiver<BatchProgress> {
        self.shared.progress.subscribe()
    }
}

fn aggregate(results: Vec<BatchItemResult>, total_duration: Duration, cancelled: bool) -> BatchResult {
    let successful: Vec<Value> = results.iter().filter_map(|r| r.data.clone()).collect();
    let failed: Vec<BatchItemResult> = results.iter().filter(|r| !r.success).cloned().collect();
    let success_rate = if results.is_empty() {
        0.0
    } else {
        successful.len() as f64 / results.len() as f64
    };

    BatchResult {
        results,
        successful,
        failed,
        total_duration,
        success_rate,
        cancelled,
    }
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("function_name", &self.function_name)
            .field("concurrency", &self.concurrency)
            .field("loading", &self.is_loading())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, success: bool) -> BatchItemResult {
        BatchItemResult {
            index,
            success,
            data: success.then(|| Value::from(index)),
            error: (!success).then_some(PoolError::PoolTerminated),
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_aggregate_rates() {
        let result = aggregate(vec![item(0, true), item(1, false), item(2, true), item(3, true)], Duration::ZERO, false);

        assert_eq!(result.success_rate, 0.75);
        assert_eq!(result.successful, vec![Value::from(0), Value::from(2), Value::from(3)]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].index, 1);
    }

    #[test]
    fn test_aggregate_empty() {
        let result = aggregate(Vec::new(), Duration::ZERO, false);
        assert_eq!(result.success_rate, 0.0);
        assert!(result.results.is_empty());
    }
}
