// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The worker pool scheduler.
//!
//! All scheduling state lives behind one mutex and is only touched in short synchronous sections:
//! enqueueing, pairing queued tasks with idle contexts, and handling replies. Each context has a
//! listener task on the caller's runtime that feeds its replies back into the pool, and each
//! `execute` call waits on a oneshot channel raced against its deadline and cancellation signal.
//!
//! # Task lifecycle
//!
//! ```text
//! execute ──▶ queued ──▶ dispatched ──▶ completed | failed
//!               │            │
//!               └─ timeout / cancel: removed from queue, or abandoned on its context
//! ```
//!
//! An abandoned task keeps its context busy until the late reply arrives, which is then discarded.
//! If the reply does not arrive within the configured grace period the context is replaced.

use super::context::{self, ContextBootstrap, ContextHandle, ContextId, ContextRecord, ContextState};
use super::payload;
use super::registry::{FunctionRegistry, FunctionTable};
use super::shared::SharedRegion;
use super::stats::{PoolStats, Totals};
use super::task::{ProgressCallback, QueuedTask, TaskId, TaskOptions};
use crate::config::consts::MAX_STARTUP_FAILURES;
use crate::config::PoolConfig;
use crate::errors::{ConfigError, PoolError};
use crate::observability::messages::pool::{
    ContextFaulted, ContextReady, ContextRetired, ContextSpawned, PoolTerminated, RegistryRebuilt,
    TaskAbandoned, TaskCompleted, TaskDispatched, TaskFailed,
};
use crate::observability::messages::StructuredLog;
use crate::protocol::{Envelope, ErrorPayload, ExecutePayload, MessageType, ProgressPayload, ReadyPayload, ResultPayload};
use crate::traits::ComputeFunction;
use crate::wasm::WasmLoader;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

type Reply = Result<Value, PoolError>;

/// A task the pool still owes an answer to.
struct PendingTask {
    function_name: String,
    reply: oneshot::Sender<Reply>,
    on_progress: Option<ProgressCallback>,
    context_id: Option<ContextId>,
    dispatched_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
enum AbandonReason {
    Timeout,
    Cancelled,
}

struct PoolState {
    initialized: bool,
    runtime: Option<Handle>,
    registry: FunctionRegistry,
    table: Arc<FunctionTable>,
    contexts: BTreeMap<ContextId, ContextHandle>,
    next_context_id: ContextId,
    queue: super::queue::TaskQueue,
    pending: HashMap<TaskId, PendingTask>,
    /// Timed-out or cancelled tasks still running, mapped to the context running them.
    abandoned: HashMap<TaskId, ContextId>,
    next_sequence: u64,
    totals: Totals,
    /// Contexts that died before their handshake since the last one that came up.
    startup_failures: u32,
}

impl PoolState {
    fn count(&self, state: ContextState) -> usize {
        self.contexts.values().filter(|c| c.state() == state).count()
    }

    fn has_usable_context(&self) -> bool {
        self.contexts
            .values()
            .any(|c| matches!(c.state(), ContextState::Idle | ContextState::Busy))
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            total_workers: self.contexts.len(),
            idle_workers: self.count(ContextState::Idle),
            busy_workers: self.count(ContextState::Busy),
            starting_workers: self.count(ContextState::Starting),
            queue_length: self.queue.len(),
            in_flight: self.pending.len().saturating_sub(self.queue.len()),
            tasks_completed: self.totals.completed,
            tasks_failed: self.totals.failed,
            tasks_cancelled: self.totals.cancelled,
            average_duration_ms: self.totals.average_duration_ms(),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    loader: Arc<WasmLoader>,
    shared: Option<SharedRegion>,
    state: Mutex<PoolState>,
    stats: watch::Sender<PoolStats>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        // Dropping the handles stops every context thread
        state.contexts.clear();
    }
}

/// Runs registered functions inside a bounded set of isolation contexts.
///
/// `WorkerPool` is a cheap handle; clones share the same contexts, queue and registry. Dropping the
/// last handle shuts every context down.
///
/// # Examples
///
/// ```rust,no_run
/// use the_offload::config::PoolConfig;
/// use the_offload::pool::{TaskOptions, WorkerPool};
/// use the_offload::traits::from_fn;
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::new(PoolConfig::default().with_max_workers(2))?;
/// pool.register("double", from_fn(|x| Ok(json!(x.as_i64().unwrap_or(0) * 2))));
///
/// let output = pool.execute("double", json!(21), TaskOptions::default()).await?;
/// assert_eq!(output, json!(42));
/// pool.terminate();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        let loader = WasmLoader::new().map_err(|e| ConfigError::invalid("wasm.engine", e.to_string()))?;
        Self::with_loader(config, Arc::new(loader))
    }

    /// Build a pool that compiles dependencies through an existing loader and its module cache.
    pub fn with_loader(config: PoolConfig, loader: Arc<WasmLoader>) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = config
            .use_shared_memory
            .then(|| SharedRegion::new(config.shared_memory_bytes));
        let registry = FunctionRegistry::default();
        let table = registry.snapshot();
        let (stats, _) = watch::channel(PoolStats::default());

        let state = PoolState {
            initialized: false,
            runtime: None,
            registry,
            table,
            contexts: BTreeMap::new(),
            next_context_id: 1,
            queue: Default::default(),
            pending: HashMap::new(),
            abandoned: HashMap::new(),
            next_sequence: 0,
            totals: Totals::default(),
            startup_failures: 0,
        };

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                loader,
                shared,
                state: Mutex::new(state),
                stats,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn loader(&self) -> &Arc<WasmLoader> {
        &self.inner.loader
    }

    /// The region handed to every context, when shared memory is enabled.
    pub fn shared_region(&self) -> Option<SharedRegion> {
        self.inner.shared.clone()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &PoolState) {
        self.inner.stats.send_replace(state.snapshot());
    }

    // ---------------------------------------------------------------------------------------------
    // Registry
    // ---------------------------------------------------------------------------------------------

    /// Register (or replace) a function under `name`.
    ///
    /// Takes effect for the next `execute`: idle contexts are replaced with ones built from the new
    /// table right away, busy ones finish their current task and are then retired.
    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: ComputeFunction + 'static,
    {
        self.register_arc(name, Arc::new(function));
    }

    pub fn register_arc(&self, name: impl Into<String>, function: Arc<dyn ComputeFunction>) {
        let name = name.into();
        let mut state = self.lock();
        state.registry.register(name.clone(), function);
        self.rebuild_locked(&mut state, &name);
        self.publish(&state);
    }

    /// Remove a function. Returns `false` if it was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        let mut state = self.lock();
        if !state.registry.unregister(name) {
            return false;
        }
        self.rebuild_locked(&mut state, name);
        self.publish(&state);
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.lock().registry.contains(name)
    }

    /// Registered function names in sorted order.
    pub fn registered_functions(&self) -> Vec<String> {
        self.lock().table.names()
    }

    fn rebuild_locked(&self, state: &mut PoolState, function_name: &str) {
        state.table = state.registry.snapshot();
        if !state.initialized {
            return;
        }

        let stale: Vec<ContextId> = state
            .contexts
            .iter()
            .filter(|(_, c)| c.state() != ContextState::Busy)
            .map(|(id, _)| *id)
            .collect();
        let mut retiring = 0;
        for handle in state.contexts.values_mut() {
            if handle.state() == ContextState::Busy {
                handle.record.retiring = true;
                retiring += 1;
            }
        }
        for id in &stale {
            if state.contexts.remove(id).is_some() {
                ContextRetired {
                    context_id: *id,
                    reason: "registry changed",
                }
                .log();
            }
        }

        RegistryRebuilt {
            function_name,
            generation: state.registry.generation(),
            replaced: stale.len(),
            retiring,
        }
        .log();

        for _ in 0..stale.len() {
            if let Err(e) = self.spawn_context_locked(state) {
                tracing::warn!(error = %e, "Failed to replace isolation context after registry change");
                break;
            }
        }
        self.replenish_locked(state);
        self.dispatch_locked(state);
    }

    // ---------------------------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------------------------

    /// Bring up the initial contexts and wait for their handshakes. Idempotent.
    ///
    /// Called implicitly by `execute`. Contexts that fail to start do not fail initialization;
    /// they are counted towards the startup failure limit instead.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let handshakes = {
            let mut state = self.lock();
            if state.initialized {
                return Ok(());
            }
            let runtime = Handle::try_current().map_err(|e| PoolError::WorkerFault {
                context_id: state.next_context_id,
                reason: format!("the pool must be initialized inside a tokio runtime: {}", e),
            })?;
            state.initialized = true;
            state.runtime = Some(runtime);

            let mut handshakes = Vec::new();
            for _ in 0..self.inner.config.initial_workers() {
                match self.spawn_context_locked(&mut state) {
                    Ok(ready) => handshakes.push(ready),
                    Err(e) => {
                        state.contexts.clear();
                        state.initialized = false;
                        self.publish(&state);
                        return Err(e);
                    }
                }
            }
            self.publish(&state);
            handshakes
        };

        // A context that dies or is replaced before its handshake just drops its sender
        futures::future::join_all(handshakes).await;
        Ok(())
    }

    /// Reject every queued and running task with `PoolTerminated` and stop every context.
    ///
    /// Registered functions and lifetime totals are kept; the next `execute` brings the pool back up.
    pub fn terminate(&self) {
        let mut state = self.lock();
        let contexts = state.contexts.len();
        state.queue.drain();
        let rejected: Vec<PendingTask> = state.pending.drain().map(|(_, task)| task).collect();
        let rejected_tasks = rejected.len();
        for task in rejected {
            let _ = task.reply.send(Err(PoolError::PoolTerminated));
        }
        state.abandoned.clear();
        state.contexts.clear();
        state.initialized = false;
        state.startup_failures = 0;

        PoolTerminated {
            contexts,
            rejected_tasks,
        }
        .log();
        self.publish(&state);
    }

    // ---------------------------------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------------------------------

    /// Run `function_name` on `input` in an isolation context.
    ///
    /// Resolves with the function's output, or with the first of: function error, worker fault,
    /// timeout (queue wait plus execution), cancellation, or pool termination.
    pub async fn execute(&self, function_name: &str, input: Value, options: TaskOptions) -> Result<Value, PoolError> {
        let signal = options.signal.clone().unwrap_or_default();
        if signal.is_cancelled() {
            return Err(PoolError::TaskCancelled {
                function_name: function_name.to_string(),
            });
        }
        if !self.is_registered(function_name) {
            return Err(PoolError::FunctionNotRegistered {
                function_name: function_name.to_string(),
            });
        }

        self.initialize().await?;

        let timeout = options.timeout.unwrap_or_else(|| self.inner.config.timeout());
        let deadline = tokio::time::sleep(timeout);
        let (task_id, mut reply) = self.enqueue(function_name, input, &options)?;

        let reason = tokio::select! {
            outcome = &mut reply => return outcome.unwrap_or(Err(PoolError::PoolTerminated)),
            _ = deadline => AbandonReason::Timeout,
            _ = signal.cancelled() => AbandonReason::Cancelled,
        };

        if self.abandon(&task_id, reason) {
            return Err(match reason {
                AbandonReason::Timeout => PoolError::TaskTimeout {
                    function_name: function_name.to_string(),
                    timeout,
                },
                AbandonReason::Cancelled => PoolError::TaskCancelled {
                    function_name: function_name.to_string(),
                },
            });
        }

        // The task settled between the deadline firing and the abandon
        reply.try_recv().unwrap_or(Err(PoolError::PoolTerminated))
    }

    /// Serialize a typed input, run the function and deserialize its output.
    pub async fn execute_as<I, O>(&self, function_name: &str, input: &I, options: TaskOptions) -> Result<O, PoolError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let contract_error = |message: String| PoolError::TaskExecution {
            function_name: function_name.to_string(),
            message,
            stack: None,
        };
        let input = serde_json::to_value(input).map_err(|e| contract_error(format!("Input could not be serialized: {}", e)))?;
        let output = self.execute(function_name, input, options).await?;
        serde_json::from_value(output)
            .map_err(|e| contract_error(format!("Output does not match the expected type: {}", e)))
    }

    fn enqueue(
        &self,
        function_name: &str,
        input: Value,
        options: &TaskOptions,
    ) -> Result<(TaskId, oneshot::Receiver<Reply>), PoolError> {
        let mut state = self.lock();
        if !state.registry.contains(function_name) {
            return Err(PoolError::FunctionNotRegistered {
                function_name: function_name.to_string(),
            });
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let task_id = format!("task-{}", sequence);
        let (tx, rx) = oneshot::channel();

        state.pending.insert(
            task_id.clone(),
            PendingTask {
                function_name: function_name.to_string(),
                reply: tx,
                on_progress: options.on_progress.clone(),
                context_id: None,
                dispatched_at: None,
            },
        );
        state.queue.push(QueuedTask {
            id: task_id.clone(),
            function_name: function_name.to_string(),
            input,
            priority: options.priority(),
            sequence,
            created_at: Instant::now(),
        });

        self.dispatch_locked(&mut state);
        self.publish(&state);
        Ok((task_id, rx))
    }

    /// Give up on a task. Returns `false` if it already settled.
    fn abandon(&self, task_id: &str, reason: AbandonReason) -> bool {
        let mut state = self.lock();
        let Some(task) = state.pending.remove(task_id) else {
            return false;
        };
        match reason {
            AbandonReason::Timeout => state.totals.record_failure(),
            AbandonReason::Cancelled => state.totals.record_cancel(),
        }

        let was_queued = state.queue.remove(task_id).is_some();
        if let (false, Some(context_id)) = (was_queued, task.context_id) {
            state.abandoned.insert(task_id.to_string(), context_id);
            TaskAbandoned {
                task_id,
                context_id,
                reason: match reason {
                    AbandonReason::Timeout => "timed out",
                    AbandonReason::Cancelled => "cancelled",
                },
            }
            .log();

            if let (Some(grace), Some(runtime)) = (self.inner.config.abandoned_task_grace(), state.runtime.clone()) {
                let pool = Arc::downgrade(&self.inner);
                let task_id = task_id.to_string();
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = pool.upgrade() {
                        WorkerPool { inner }.recycle_if_abandoned(&task_id, grace);
                    }
                });
            }
        }

        self.publish(&state);
        true
    }

    /// Replace the context still running an abandoned task once its grace period is over.
    fn recycle_if_abandoned(&self, task_id: &str, grace: Duration) {
        let mut state = self.lock();
        let Some(context_id) = state.abandoned.remove(task_id) else {
            return;
        };
        if state.contexts.remove(&context_id).is_some() {
            let reason = format!("abandoned task {} still running after {:?}", task_id, grace);
            ContextRetired {
                context_id,
                reason: &reason,
            }
            .log();
        }
        self.replenish_locked(&mut state);
        self.dispatch_locked(&mut state);
        self.publish(&state);
    }

    // ---------------------------------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------------------------------

    fn spawn_context_locked(&self, state: &mut PoolState) -> Result<oneshot::Receiver<()>, PoolError> {
        let id = state.next_context_id;
        let Some(runtime) = state.runtime.clone() else {
            return Err(PoolError::WorkerFault {
                context_id: id,
                reason: "pool is not initialized".to_string(),
            });
        };
        state.next_context_id += 1;

        let generation = state.registry.generation();
        let bootstrap = ContextBootstrap {
            table: state.table.clone(),
            dependencies: self.inner.config.remote_dependencies.clone(),
            aliases: self.inner.config.remote_dependency_names.clone(),
            loader: self.inner.loader.clone(),
            shared: self.inner.shared.clone(),
        };
        let (mut handle, replies) = context::spawn(id, generation, bootstrap).map_err(|e| PoolError::WorkerFault {
            context_id: id,
            reason: format!("failed to start context thread: {}", e),
        })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        handle.ready = Some(ready_tx);
        ContextSpawned {
            context_id: id,
            generation,
            function_count: state.table.len(),
        }
        .log();

        runtime.spawn(listen(Arc::downgrade(&self.inner), id, replies));
        state.contexts.insert(id, handle);
        Ok(ready_rx)
    }

    /// Keep at least `initial_workers` contexts alive.
    fn replenish_locked(&self, state: &mut PoolState) {
        let minimum = self.inner.config.initial_workers();
        while state.initialized && state.contexts.len() < minimum && state.startup_failures < MAX_STARTUP_FAILURES {
            if let Err(e) = self.spawn_context_locked(state) {
                tracing::warn!(error = %e, "Failed to replace isolation context");
                break;
            }
        }
    }

    /// Pair queued tasks with idle contexts until one side runs out.
    fn dispatch_locked(&self, state: &mut PoolState) {
        while !state.queue.is_empty() {
            let idle = state
                .contexts
                .iter()
                .find(|(_, c)| c.state() == ContextState::Idle)
                .map(|(id, _)| *id);
            let Some(context_id) = idle else {
                self.grow_locked(state);
                return;
            };
            let Some(task) = state.queue.pop_next() else {
                return;
            };

            TaskDispatched {
                task_id: &task.id,
                function_name: &task.function_name,
                context_id,
                priority: task.priority,
                buffers: payload::collect_buffers(&task.input).count,
            }
            .log();

            let QueuedTask {
                id,
                function_name,
                input,
                priority,
                sequence,
                created_at,
            } = task;
            let envelope = Envelope::execute(
                id.clone(),
                ExecutePayload {
                    function_name: function_name.clone(),
                    input,
                },
            );

            let Some(handle) = state.contexts.get_mut(&context_id) else {
                return;
            };
            match handle.send(envelope) {
                Ok(()) => {
                    handle.record.state = ContextState::Busy;
                    handle.record.current_task_id = Some(id.clone());
                    handle.record.last_active_at = Instant::now();
                    if let Some(pending) = state.pending.get_mut(&id) {
                        pending.context_id = Some(context_id);
                        pending.dispatched_at = Some(Instant::now());
                    }
                }
                Err(returned) => {
                    // The context died before we noticed; its listener will clean it up
                    handle.record.state = ContextState::Error;
                    let input = returned
                        .into_payload::<ExecutePayload>()
                        .map(|p| p.input)
                        .unwrap_or(Value::Null);
                    state.queue.push(QueuedTask {
                        id,
                        function_name,
                        input,
                        priority,
                        sequence,
                        created_at,
                    });
                }
            }
        }
    }

    /// Spawn a context on demand when the backlog exceeds the contexts already starting.
    fn grow_locked(&self, state: &mut PoolState) {
        let starting = state.count(ContextState::Starting);
        if starting >= state.queue.len() || state.contexts.len() >= self.inner.config.max_workers {
            return;
        }
        if state.startup_failures >= MAX_STARTUP_FAILURES {
            if starting == 0 && !state.has_usable_context() {
                let reason = format!("{} isolation contexts in a row failed to start", state.startup_failures);
                let last_context = state.next_context_id.saturating_sub(1);
                self.fail_queue_locked(state, last_context, &reason);
            }
            return;
        }
        if let Err(e) = self.spawn_context_locked(state) {
            tracing::warn!(error = %e, "Failed to spawn isolation context on demand");
        }
    }

    fn fail_queue_locked(&self, state: &mut PoolState, context_id: ContextId, reason: &str) {
        for task in state.queue.drain() {
            if let Some(pending) = state.pending.remove(&task.id) {
                state.totals.record_failure();
                let error = PoolError::WorkerFault {
                    context_id,
                    reason: reason.to_string(),
                };
                TaskFailed {
                    task_id: &task.id,
                    function_name: &task.function_name,
                    error: &error,
                }
                .log();
                let _ = pending.reply.send(Err(error));
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Messages from contexts
    // ---------------------------------------------------------------------------------------------

    fn handle_message(&self, context_id: ContextId, envelope: Envelope) {
        match envelope.kind {
            MessageType::Ready => self.on_ready(context_id, envelope),
            MessageType::Progress => self.on_progress(context_id, envelope),
            MessageType::Result | MessageType::Error => self.on_reply(context_id, envelope),
            other => {
                tracing::warn!(context_id, kind = ?other, "Unexpected message from isolation context");
            }
        }
    }

    fn on_ready(&self, context_id: ContextId, envelope: Envelope) {
        let functions = envelope
            .payload_as::<ReadyPayload>()
            .map(|payload| payload.functions)
            .unwrap_or_default();

        let mut state = self.lock();
        let Some(handle) = state.contexts.get_mut(&context_id) else {
            return;
        };
        if handle.state() != ContextState::Starting {
            return;
        }
        handle.record.state = ContextState::Idle;
        handle.record.last_active_at = Instant::now();
        if let Some(ready) = handle.ready.take() {
            let _ = ready.send(());
        }
        state.startup_failures = 0;

        ContextReady {
            context_id,
            functions: &functions,
        }
        .log();
        self.dispatch_locked(&mut state);
        self.publish(&state);
    }

    fn on_progress(&self, context_id: ContextId, envelope: Envelope) {
        let payload = match envelope.into_payload::<ProgressPayload>() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(context_id, error = %e, "Malformed progress message");
                return;
            }
        };
        let callback = {
            let state = self.lock();
            state
                .pending
                .get(&payload.task_id)
                .filter(|task| task.context_id == Some(context_id))
                .and_then(|task| task.on_progress.clone())
        };
        // Outside the lock: the callback may call back into the pool
        if let Some(callback) = callback {
            callback(&payload.progress);
        }
    }

    fn on_reply(&self, context_id: ContextId, envelope: Envelope) {
        let task_id = envelope.id.clone();
        let kind = envelope.kind;

        let mut state = self.lock();
        let generation = state.registry.generation();
        let retire = match state.contexts.get_mut(&context_id) {
            Some(handle) if handle.record.current_task_id.as_deref() == Some(task_id.as_str()) => {
                handle.record.current_task_id = None;
                handle.record.last_active_at = Instant::now();
                match kind {
                    MessageType::Result => handle.record.tasks_completed += 1,
                    _ => handle.record.error_count += 1,
                }
                if handle.record.retiring || handle.record.generation != generation {
                    true
                } else {
                    handle.record.state = ContextState::Idle;
                    false
                }
            }
            Some(_) => {
                tracing::warn!(context_id, task_id = %task_id, "Discarding reply for a task the context is not running");
                return;
            }
            None => return,
        };
        if retire && state.contexts.remove(&context_id).is_some() {
            ContextRetired {
                context_id,
                reason: "registry changed while busy",
            }
            .log();
        }

        if state.abandoned.remove(&task_id).is_some() {
            tracing::debug!(context_id, task_id = %task_id, "Discarding late reply for abandoned task");
        } else if let Some(pending) = state.pending.remove(&task_id) {
            let elapsed = pending.dispatched_at.map(|t| t.elapsed()).unwrap_or_default();
            let outcome = match kind {
                MessageType::Result => envelope
                    .into_payload::<ResultPayload>()
                    .map(|result| (result.data, result.output_size))
                    .map_err(|e| PoolError::TaskExecution {
                        function_name: pending.function_name.clone(),
                        message: format!("Malformed result payload: {}", e),
                        stack: None,
                    }),
                _ => {
                    let error = envelope.into_payload::<ErrorPayload>().unwrap_or_else(|e| ErrorPayload {
                        message: format!("Malformed error payload: {}", e),
                        stack: None,
                        function_name: None,
                        duration: None,
                    });
                    Err(PoolError::TaskExecution {
                        function_name: pending.function_name.clone(),
                        message: error.message,
                        stack: error.stack,
                    })
                }
            };

            let outcome = match outcome {
                Ok((data, output_size)) => {
                    state.totals.record_success(elapsed);
                    TaskCompleted {
                        task_id: &task_id,
                        function_name: &pending.function_name,
                        duration: elapsed,
                        output_size,
                    }
                    .log();
                    Ok(data)
                }
                Err(error) => {
                    state.totals.record_failure();
                    TaskFailed {
                        task_id: &task_id,
                        function_name: &pending.function_name,
                        error: &error,
                    }
                    .log();
                    Err(error)
                }
            };
            let _ = pending.reply.send(outcome);
        }

        if retire {
            self.replenish_locked(&mut state);
        }
        self.dispatch_locked(&mut state);
        self.publish(&state);
    }

    /// The context's reply channel closed. Intentional shutdowns have already removed the
    /// context, so anything still registered here died unexpectedly.
    fn on_exit(&self, context_id: ContextId) {
        let mut state = self.lock();
        let Some(mut handle) = state.contexts.remove(&context_id) else {
            return;
        };
        let was_starting = handle.state() == ContextState::Starting;
        handle.record.state = ContextState::Error;
        let task_id = handle.record.current_task_id.take();
        let reason = if was_starting {
            "isolation context exited before it was ready"
        } else {
            "isolation context exited unexpectedly"
        };
        ContextFaulted {
            context_id,
            task_id: task_id.as_deref(),
            reason,
        }
        .log();
        drop(handle);

        if let Some(task_id) = task_id {
            if state.abandoned.remove(&task_id).is_none() {
                if let Some(pending) = state.pending.remove(&task_id) {
                    state.totals.record_failure();
                    let _ = pending.reply.send(Err(PoolError::WorkerFault {
                        context_id,
                        reason: reason.to_string(),
                    }));
                }
            }
        }
        if was_starting {
            state.startup_failures += 1;
        }

        self.replenish_locked(&mut state);
        self.dispatch_locked(&mut state);
        self.publish(&state);
    }

    // ---------------------------------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------------------------------

    /// Latest published statistics. Never waits on running work.
    pub fn get_stats(&self) -> PoolStats {
        self.inner.stats.borrow().clone()
    }

    /// Receive a new `PoolStats` on every state change.
    pub fn subscribe_stats(&self) -> watch::Receiver<PoolStats> {
        self.inner.stats.subscribe()
    }

    pub fn contexts(&self) -> Vec<ContextRecord> {
        self.lock().contexts.values().map(|c| c.record.clone()).collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.get_stats())
            .finish()
    }
}

/// Feed a context's messages into the pool until its reply channel closes.
async fn listen(pool: Weak<PoolInner>, context_id: ContextId, mut replies: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = replies.recv().await {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        WorkerPool { inner }.handle_message(context_id, envelope);
    }
    if let Some(inner) = pool.upgrade() {
        WorkerPool { inner }.on_exit(context_id);
    }
}
