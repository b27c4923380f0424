// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Sequential stage runner on top of the worker pool.
//!
//! Each stage maps to one pool call, possibly retried. The output of a stage is the input of the
//! next; skipped stages pass the carried value through. A pipeline has at most one active run:
//! starting a new run cancels the previous one, and every state write is guarded by the run id so a
//! superseded run can never overwrite the newer run's state.

use super::events::{PipelineEvent, PipelineStatus};
use super::report::{millis, PipelineReport, TimelineEvent, TimelineKind};
use super::stage::{StageConfig, StageState, StageStatus};
use crate::config::PipelineConfig;
use crate::errors::{PipelineError, PoolError};
use crate::observability::messages::pipeline::{RunFinished, RunStarted, StageFailed, StageRetrying, StageSkipped};
use crate::observability::messages::StructuredLog;
use crate::pool::{TaskOptions, WorkerPool};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub name: String,
    /// Stop the run at the first stage that exhausts its retries. When false, the failed stage is
    /// recorded and the run continues with the last successfully produced value.
    pub stop_on_error: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            stop_on_error: true,
        }
    }
}

/// Result of a run that reached its last stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub output: Value,
    /// One entry per completed or skipped stage, in stage order.
    pub stage_results: Vec<Value>,
    /// Ids of stages that failed but were tolerated (`stop_on_error = false`).
    pub failed_stages: Vec<String>,
    pub duration: Duration,
}

struct RunState {
    run_id: u64,
    status: PipelineStatus,
    current_stage: Option<usize>,
    stages: Vec<StageState>,
    results: Vec<Value>,
    initial_input: Option<Value>,
    final_output: Option<Value>,
    error: Option<PipelineError>,
    failed_stages: Vec<String>,
    timeline: Vec<TimelineEvent>,
    timeline_origin: Option<Instant>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    progress: f64,
    signal: CancellationToken,
}

impl RunState {
    fn record(&mut self, index: usize, kind: TimelineKind, duration: Option<Duration>, message: Option<String>) {
        let origin = *self.timeline_origin.get_or_insert_with(Instant::now);
        let stage_id = self.stages.get(index).map(|s| s.id.clone()).unwrap_or_default();
        self.timeline.push(TimelineEvent {
            stage_id,
            stage_index: index,
            kind,
            at_ms: millis(origin.elapsed()),
            duration_ms: duration.map(millis),
            message,
        });
    }

    fn settled_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_settled()).count()
    }

    fn overall_progress(&self, current_fraction: f64) -> f64 {
        if self.stages.is_empty() {
            return 1.0;
        }
        ((self.settled_count() as f64 + current_fraction) / self.stages.len() as f64).min(1.0)
    }

    fn total_duration(&self) -> Duration {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

enum StageOutcome {
    Produced(Value),
    Failed(PipelineError),
    Cancelled,
}

struct PipelineInner {
    pool: WorkerPool,
    stages: Vec<StageConfig>,
    options: PipelineOptions,
    state: Mutex<RunState>,
    paused: watch::Sender<bool>,
    events: broadcast::Sender<PipelineEvent>,
}

/// Runs an ordered list of stages against the worker pool.
///
/// `Pipeline` is a cheap handle: clone it to call `pause`, `resume` or `cancel` from another task
/// while `run` is awaited.
///
/// # Examples
///
/// ```rust,no_run
/// use the_offload::pipeline::{Pipeline, PipelineOptions, StageConfig};
/// use the_offload::pool::WorkerPool;
/// use serde_json::json;
///
/// # async fn demo(pool: WorkerPool) -> Result<(), the_offload::errors::PipelineError> {
/// let pipeline = Pipeline::new(
///     pool,
///     vec![StageConfig::new("inc", "add_one"), StageConfig::new("dbl", "double")],
///     PipelineOptions::default(),
/// );
/// let result = pipeline.run(json!(5)).await?;
/// assert_eq!(result.stage_results, vec![json!(6), json!(12)]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(pool: WorkerPool, stages: Vec<StageConfig>, options: PipelineOptions) -> Self {
        let stage_states = stages.iter().map(StageState::pending).collect();
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(PipelineInner {
                pool,
                stages,
                options,
                state: Mutex::new(RunState {
                    run_id: 0,
                    status: PipelineStatus::Idle,
                    current_stage: None,
                    stages: stage_states,
                    results: Vec::new(),
                    initial_input: None,
                    final_output: None,
                    error: None,
                    failed_stages: Vec::new(),
                    timeline: Vec::new(),
                    timeline_origin: None,
                    started_at: None,
                    completed_at: None,
                    progress: 0.0,
                    signal: CancellationToken::new(),
                }),
                paused,
                events,
            }),
        }
    }

    /// Build stages and options from a configuration section.
    pub fn from_config(pool: WorkerPool, config: &PipelineConfig) -> Self {
        let stages = config.stages.iter().map(StageConfig::from).collect();
        let options = PipelineOptions {
            name: config.name.clone(),
            stop_on_error: config.stop_on_error,
        };
        Self::new(pool, stages, options)
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Apply `f` to the run state unless a newer run has replaced `run_id`.
    fn update<R>(&self, run_id: u64, f: impl FnOnce(&mut RunState) -> R) -> Option<R> {
        let mut state = self.lock();
        if state.run_id != run_id {
            return None;
        }
        Some(f(&mut state))
    }

    // ---------------------------------------------------------------------------------------------
    // Control
    // ---------------------------------------------------------------------------------------------

    /// Run every stage from the first, cancelling any run in progress.
    pub async fn run(&self, input: Value) -> Result<PipelineOutput, PipelineError> {
        let (run_id, signal) = {
            let mut state = self.lock();
            state.stages = self.inner.stages.iter().map(StageState::pending).collect();
            state.results.clear();
            state.failed_stages.clear();
            state.timeline.clear();
            state.timeline_origin = Some(Instant::now());
            state.initial_input = Some(input.clone());
            self.begin_locked(&mut state)
        };
        self.drive(run_id, signal, 0, input, Vec::new()).await
    }

    /// Resume from the first failed stage, keeping the outputs of the stages before it.
    pub async fn retry(&self) -> Result<PipelineOutput, PipelineError> {
        let (run_id, signal, index, carry, results) = {
            let mut state = self.lock();
            if state.status.is_active() {
                return Err(PipelineError::AlreadyRunning);
            }
            let Some(index) = state.stages.iter().position(|s| s.status == StageStatus::Failed) else {
                return Err(PipelineError::NothingToRetry);
            };

            let carry = state.stages[..index]
                .iter()
                .rev()
                .find_map(|s| s.output.clone())
                .or_else(|| state.initial_input.clone())
                .unwrap_or(Value::Null);
            let results: Vec<Value> = state.stages[..index]
                .iter()
                .filter(|s| s.is_settled())
                .filter_map(|s| s.output.clone())
                .collect();

            for (stage, config) in state.stages[index..].iter_mut().zip(&self.inner.stages[index..]) {
                *stage = StageState::pending(config);
            }
            state.results = results.clone();
            state.failed_stages.clear();
            let (run_id, signal) = self.begin_locked(&mut state);
            (run_id, signal, index, carry, results)
        };
        self.drive(run_id, signal, index, carry, results).await
    }

    fn begin_locked(&self, state: &mut RunState) -> (u64, CancellationToken) {
        state.signal.cancel();
        state.signal = CancellationToken::new();
        state.run_id += 1;
        state.status = PipelineStatus::Running;
        state.current_stage = None;
        state.final_output = None;
        state.error = None;
        state.started_at = Some(Instant::now());
        state.completed_at = None;
        state.progress = state.overall_progress(0.0);
        self.inner.paused.send_replace(false);
        (state.run_id, state.signal.clone())
    }

    /// Cancel the active run. The stage in flight is cancelled through the pool.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.signal.cancel();
        if state.status.is_active() {
            state.status = PipelineStatus::Cancelled;
            state.completed_at = Some(Instant::now());
            self.emit(PipelineEvent::Cancelled);
        }
    }

    /// Hold the run at the next stage attempt boundary. A stage already executing is not interrupted.
    pub fn pause(&self) {
        let mut state = self.lock();
        if state.status == PipelineStatus::Running {
            state.status = PipelineStatus::Paused;
            self.inner.paused.send_replace(true);
            self.emit(PipelineEvent::Paused);
        }
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        if state.status == PipelineStatus::Paused {
            state.status = PipelineStatus::Running;
            self.inner.paused.send_replace(false);
            self.emit(PipelineEvent::Resumed);
        }
    }

    /// Receive lifecycle events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    // ---------------------------------------------------------------------------------------------
    // Run loop
    // ---------------------------------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: u64,
        signal: CancellationToken,
        start_index: usize,
        mut carry: Value,
        mut results: Vec<Value>,
    ) -> Result<PipelineOutput, PipelineError> {
        RunStarted {
            pipeline: self.name(),
            run_id,
            stage_count: self.inner.stages.len(),
            start_index,
        }
        .log();
        self.emit(PipelineEvent::RunStarted { run_id, start_index });
        let started = Instant::now();
        let mut failed_stages = Vec::new();

        for (index, stage) in self.inner.stages.iter().enumerate().skip(start_index) {
            match self.run_stage(run_id, &signal, index, stage, &carry, &results).await {
                StageOutcome::Produced(output) => {
                    results.push(output.clone());
                    self.update(run_id, |state| state.results = results.clone());
                    carry = output;
                }
                StageOutcome::Failed(error) if self.inner.options.stop_on_error => {
                    self.finish(run_id, PipelineStatus::Failed, Some(error.clone()), None, started);
                    return Err(error);
                }
                StageOutcome::Failed(_) => {
                    // Tolerated: the last produced value carries on and nothing is recorded
                    failed_stages.push(stage.id.clone());
                    self.update(run_id, |state| state.failed_stages = failed_stages.clone());
                }
                StageOutcome::Cancelled => {
                    self.finish(run_id, PipelineStatus::Cancelled, Some(PipelineError::PipelineCancelled), None, started);
                    return Err(PipelineError::PipelineCancelled);
                }
            }
        }

        if !self.finish(run_id, PipelineStatus::Completed, None, Some(carry.clone()), started) {
            return Err(PipelineError::PipelineCancelled);
        }
        Ok(PipelineOutput {
            output: carry,
            stage_results: results,
            failed_stages,
            duration: started.elapsed(),
        })
    }

    /// Record the end of a run. Returns false if the run was superseded or cancelled meanwhile.
    fn finish(
        &self,
        run_id: u64,
        status: PipelineStatus,
        error: Option<PipelineError>,
        output: Option<Value>,
        started: Instant,
    ) -> bool {
        let finished = self.update(run_id, |state| {
            if state.status == PipelineStatus::Cancelled && status != PipelineStatus::Cancelled {
                return false;
            }
            if status == PipelineStatus::Cancelled {
                if let Some(index) = state.current_stage {
                    if state.stages[index].status == StageStatus::Running {
                        state.stages[index].status = StageStatus::Pending;
                        state.record(index, TimelineKind::Cancelled, None, None);
                    }
                }
            }
            state.status = status;
            state.error = error;
            if status == PipelineStatus::Completed {
                state.progress = 1.0;
                state.current_stage = None;
            }
            state.final_output = output;
            state.completed_at.get_or_insert_with(Instant::now);
            true
        });

        let finished = finished.unwrap_or(false);
        if finished {
            RunFinished {
                pipeline: self.name(),
                run_id,
                status: status.as_str(),
                duration: started.elapsed(),
            }
            .log();
            self.emit(PipelineEvent::RunFinished { run_id, status });
        }
        finished
    }

    /// Wait while paused. Returns false if the run was cancelled meanwhile.
    async fn wait_while_paused(&self, signal: &CancellationToken) -> bool {
        let mut gate = self.inner.paused.subscribe();
        loop {
            if !*gate.borrow_and_update() {
                return !signal.is_cancelled();
            }
            tokio::select! {
                _ = signal.cancelled() => return false,
                changed = gate.changed() => {
                    if changed.is_err() {
                        return !signal.is_cancelled();
                    }
                }
            }
        }
    }

    async fn run_stage(
        &self,
        run_id: u64,
        signal: &CancellationToken,
        index: usize,
        stage: &StageConfig,
        carry: &Value,
        previous: &[Value],
    ) -> StageOutcome {
        loop {
            if !self.wait_while_paused(signal).await {
                return StageOutcome::Cancelled;
            }

            if stage.should_skip(carry, previous) {
                let recorded = self.update(run_id, |state| {
                    let entry = &mut state.stages[index];
                    entry.status = StageStatus::Skipped;
                    entry.input = Some(carry.clone());
                    entry.output = Some(carry.clone());
                    entry.progress = 1.0;
                    state.progress = state.overall_progress(0.0);
                    state.record(index, TimelineKind::Skipped, None, None);
                });
                if recorded.is_none() {
                    return StageOutcome::Cancelled;
                }
                StageSkipped { stage_id: &stage.id }.log();
                self.emit(PipelineEvent::StageSkipped {
                    stage_id: stage.id.clone(),
                    index,
                });
                return StageOutcome::Produced(carry.clone());
            }

            let input = stage.prepare_input(carry, previous);
            let started = Instant::now();
            let attempt = self.update(run_id, |state| {
                state.current_stage = Some(index);
                let entry = &mut state.stages[index];
                entry.status = StageStatus::Running;
                entry.input = Some(input.clone());
                entry.started_at = Some(started);
                entry.progress = 0.0;
                let attempt = entry.retry_count + 1;
                state.record(index, TimelineKind::Started, None, None);
                attempt
            });
            let Some(attempt) = attempt else {
                return StageOutcome::Cancelled;
            };
            self.emit(PipelineEvent::StageStarted {
                stage_id: stage.id.clone(),
                index,
                attempt,
            });

            let options = self.task_options(run_id, index, stage, signal);
            let outcome = self.inner.pool.execute(&stage.function_name, input, options).await;
            let duration = started.elapsed();

            let error = match outcome {
                Ok(output) => {
                    let output = stage.finish_output(output);
                    let recorded = self.update(run_id, |state| {
                        let entry = &mut state.stages[index];
                        entry.status = StageStatus::Completed;
                        entry.output = Some(output.clone());
                        entry.error = None;
                        entry.duration = Some(duration);
                        entry.completed_at = Some(Instant::now());
                        entry.progress = 1.0;
                        state.progress = state.overall_progress(0.0);
                        state.record(index, TimelineKind::Completed, Some(duration), None);
                    });
                    if recorded.is_none() {
                        return StageOutcome::Cancelled;
                    }
                    self.emit(PipelineEvent::StageCompleted {
                        stage_id: stage.id.clone(),
                        index,
                        duration,
                    });
                    return StageOutcome::Produced(output);
                }
                Err(_) if signal.is_cancelled() => return StageOutcome::Cancelled,
                Err(error) => error,
            };

            let retry_count = self.update(run_id, |state| state.stages[index].retry_count);
            let Some(retry_count) = retry_count else {
                return StageOutcome::Cancelled;
            };

            if retry_count < stage.max_retries {
                StageRetrying {
                    stage_id: &stage.id,
                    attempt: retry_count + 1,
                    max_retries: stage.max_retries,
                    delay: stage.retry_delay,
                    error: &error,
                }
                .log();
                tokio::select! {
                    _ = tokio::time::sleep(stage.retry_delay) => {}
                    _ = signal.cancelled() => return StageOutcome::Cancelled,
                }
                let recorded = self.update(run_id, |state| {
                    let entry = &mut state.stages[index];
                    entry.retry_count += 1;
                    entry.status = StageStatus::Pending;
                    entry.error = Some(error.clone());
                    let message = error.to_string();
                    state.record(index, TimelineKind::Retrying, Some(duration), Some(message));
                });
                if recorded.is_none() {
                    return StageOutcome::Cancelled;
                }
                self.emit(PipelineEvent::StageRetrying {
                    stage_id: stage.id.clone(),
                    index,
                    retry_count: retry_count + 1,
                    error,
                });
                continue;
            }

            return self.fail_stage(run_id, index, stage, error, duration, retry_count + 1);
        }
    }

    fn fail_stage(
        &self,
        run_id: u64,
        index: usize,
        stage: &StageConfig,
        error: PoolError,
        duration: Duration,
        attempts: u32,
    ) -> StageOutcome {
        StageFailed {
            stage_id: &stage.id,
            attempts,
            stop_on_error: self.inner.options.stop_on_error,
            error: &error,
        }
        .log();
        let recorded = self.update(run_id, |state| {
            let entry = &mut state.stages[index];
            entry.status = StageStatus::Failed;
            entry.error = Some(error.clone());
            entry.duration = Some(duration);
            entry.completed_at = Some(Instant::now());
            state.record(index, TimelineKind::Failed, Some(duration), Some(error.to_string()));
        });
        if recorded.is_none() {
            return StageOutcome::Cancelled;
        }
        self.emit(PipelineEvent::StageFailed {
            stage_id: stage.id.clone(),
            index,
            error: error.clone(),
        });
        StageOutcome::Failed(PipelineError::StageFailure {
            stage_id: stage.id.clone(),
            attempts,
            source: error,
        })
    }

    fn task_options(&self, run_id: u64, index: usize, stage: &StageConfig, signal: &CancellationToken) -> TaskOptions {
        let mut options = TaskOptions::default().with_signal(signal.clone());
        if let Some(timeout) = stage.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(priority) = stage.priority {
            options = options.with_priority(priority);
        }

        let pipeline = self.clone();
        let stage_id = stage.id.clone();
        options.on_progress(move |progress| {
            let fraction = (progress.percent / 100.0).clamp(0.0, 1.0);
            let overall = pipeline.update(run_id, |state| {
                state.stages[index].progress = fraction;
                state.progress = state.overall_progress(fraction);
                state.progress
            });
            if let Some(overall) = overall {
                pipeline.emit(PipelineEvent::StageProgress {
                    stage_id: stage_id.clone(),
                    index,
                    stage_progress: fraction,
                    overall,
                });
            }
        })
    }

    // ---------------------------------------------------------------------------------------------
    // Read accessors
    // ---------------------------------------------------------------------------------------------

    pub fn status(&self) -> PipelineStatus {
        self.lock().status
    }

    /// Index of the stage currently (or last) running.
    pub fn current_stage(&self) -> Option<usize> {
        self.lock().current_stage
    }

    pub fn stages(&self) -> Vec<StageState> {
        self.lock().stages.clone()
    }

    /// 0.0 to 1.0 across the whole run.
    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn stage_results(&self) -> Vec<Value> {
        self.lock().results.clone()
    }

    pub fn output(&self) -> Option<Value> {
        self.lock().final_output.clone()
    }

    pub fn error(&self) -> Option<PipelineError> {
        self.lock().error.clone()
    }

    pub fn report(&self) -> PipelineReport {
        let state = self.lock();
        PipelineReport::build(
            self.name(),
            state.status,
            state.total_duration(),
            state.progress,
            state.error.as_ref().map(ToString::to_string),
            &state.stages,
            &state.timeline,
        )
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name())
            .field("stages", &self.inner.stages)
            .field("status", &self.status())
            .finish()
    }
}
