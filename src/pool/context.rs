// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Isolation contexts.
//!
//! Each context is a dedicated OS thread running a current-thread tokio runtime. It owns an
//! immutable function table and its own bound dependencies, and it talks to the pool only through
//! envelopes: commands in, replies out. Nothing mutable is shared with the orchestrator side.
//!
//! The context's half of the handshake is: wait for `init`, bootstrap dependencies, answer
//! `ready`. After that it serves one `execute` at a time. If a function panics the thread dies,
//! the reply channel closes and the pool treats it as a fatal fault.

use super::registry::FunctionTable;
use super::scope::{Dependencies, LoadedDependency, TaskScope};
use super::shared::SharedRegion;
use super::payload;
use crate::config::RemoteDependency;
use crate::protocol::{Envelope, ErrorPayload, ExecutePayload, InitPayload, MessageType, ReadyPayload, ResultPayload};
use crate::wasm::{WasmLoader, WasmResult, WasmSource};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub type ContextId = u32;

/// Lifecycle of one isolation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Spawned, waiting for its ready handshake.
    Starting,
    Idle,
    Busy,
    /// Exited unexpectedly; about to be removed.
    Error,
    Terminated,
}

/// Bookkeeping the pool keeps for each isolation context.
#[derive(Debug, Clone)]
pub struct ContextRecord {
    pub id: ContextId,
    pub state: ContextState,
    pub current_task_id: Option<String>,
    pub tasks_completed: u64,
    pub error_count: u64,
    /// Registry generation the context's function table was built from.
    pub generation: u64,
    /// Set when the registry changed while the context was busy; it is discarded once free.
    pub retiring: bool,
    pub created_at: Instant,
    pub last_active_at: Instant,
}

impl ContextRecord {
    fn new(id: ContextId, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: ContextState::Starting,
            current_task_id: None,
            tasks_completed: 0,
            error_count: 0,
            generation,
            retiring: false,
            created_at: now,
            last_active_at: now,
        }
    }
}

/// Everything a context is built from. Moved onto the context thread.
pub(crate) struct ContextBootstrap {
    pub table: Arc<FunctionTable>,
    pub dependencies: Vec<RemoteDependency>,
    pub aliases: HashMap<String, String>,
    pub loader: Arc<WasmLoader>,
    pub shared: Option<SharedRegion>,
}

/// The pool's side of a context. Dropping the handle stops the context.
pub(crate) struct ContextHandle {
    pub record: ContextRecord,
    /// Resolved when the context answers the handshake.
    pub ready: Option<oneshot::Sender<()>>,
    commands: mpsc::UnboundedSender<Envelope>,
    kill: CancellationToken,
}

impl ContextHandle {
    /// Hand an envelope to the context. Gives the envelope back if the context is gone.
    pub fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.commands.send(envelope).map_err(|rejected| rejected.0)
    }

    pub fn state(&self) -> ContextState {
        self.record.state
    }
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn context_label(id: ContextId) -> String {
    format!("context-{}", id)
}

/// Start a context thread and send it `init`. The returned receiver yields everything the
/// context sends back, and closes when the thread exits for any reason.
pub(crate) fn spawn(
    id: ContextId,
    generation: u64,
    bootstrap: ContextBootstrap,
) -> std::io::Result<(ContextHandle, mpsc::UnboundedReceiver<Envelope>)> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let kill = CancellationToken::new();
    let thread_kill = kill.clone();

    std::thread::Builder::new()
        .name(format!("offload-{}", context_label(id)))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(context_id = id, error = %e, "Failed to build context runtime");
                    return;
                }
            };
            runtime.block_on(dispatch_loop(id, bootstrap, command_rx, reply_tx, thread_kill));
        })?;

    let handle = ContextHandle {
        record: ContextRecord::new(id, generation),
        ready: None,
        commands: command_tx,
        kill,
    };
    // A context that already died will surface through the closed reply channel.
    let _ = handle.send(Envelope::init(context_label(id), InitPayload { context_id: id }));

    Ok((handle, reply_rx))
}

/// Compile and bind every dependency, then apply aliases that are not already taken.
fn load_dependencies(
    loader: &WasmLoader,
    dependencies: &[RemoteDependency],
    aliases: &HashMap<String, String>,
) -> WasmResult<Dependencies> {
    let mut bound = Dependencies::default();
    for dependency in dependencies {
        let module = loader.compile(&WasmSource::file(&dependency.source))?;
        let global_name = dependency.global_name();
        let loaded = Arc::new(LoadedDependency {
            global_name: global_name.clone(),
            source: dependency.source.clone(),
            module,
        });
        bound.bind(global_name, loaded);
    }

    for dependency in dependencies {
        let Some(alias) = aliases.get(&dependency.source) else {
            continue;
        };
        let global_name = dependency.global_name();
        if *alias == global_name || bound.contains(alias) {
            continue;
        }
        if let Some(loaded) = bound.get(&global_name) {
            bound.bind(alias.clone(), loaded);
        }
    }

    Ok(bound)
}

async fn dispatch_loop(
    id: ContextId,
    bootstrap: ContextBootstrap,
    mut commands: mpsc::UnboundedReceiver<Envelope>,
    replies: mpsc::UnboundedSender<Envelope>,
    kill: CancellationToken,
) {
    let ContextBootstrap {
        table,
        dependencies,
        aliases,
        loader,
        shared,
    } = bootstrap;

    let bound = match load_dependencies(&loader, &dependencies, &aliases) {
        Ok(bound) => Arc::new(bound),
        Err(e) => {
            tracing::error!(context_id = id, error = %e, "Isolation context failed to load its dependencies");
            return;
        }
    };

    let announce_ready = || {
        replies.send(Envelope::ready(
            context_label(id),
            ReadyPayload {
                context_id: id,
                functions: table.names(),
            },
        ))
    };

    let mut initialized = false;
    loop {
        let envelope = tokio::select! {
            _ = kill.cancelled() => return,
            received = commands.recv() => match received {
                Some(envelope) => envelope,
                None => return,
            },
        };

        match envelope.kind {
            MessageType::Init => {
                initialized = true;
                if announce_ready().is_err() {
                    return;
                }
            }
            MessageType::Execute if initialized => {
                let reply = tokio::select! {
                    _ = kill.cancelled() => return,
                    reply = run_task(envelope, &table, &bound, &loader, &shared, &replies) => reply,
                };
                if replies.send(reply).is_err() {
                    return;
                }
            }
            other => {
                tracing::warn!(context_id = id, kind = ?other, initialized, "Isolation context ignored a message");
            }
        }
    }
}

async fn run_task(
    envelope: Envelope,
    table: &FunctionTable,
    bound: &Arc<Dependencies>,
    loader: &Arc<WasmLoader>,
    shared: &Option<SharedRegion>,
    replies: &mpsc::UnboundedSender<Envelope>,
) -> Envelope {
    let started = Instant::now();
    let task_id = envelope.id.clone();
    let elapsed_ms = |started: Instant| started.elapsed().as_secs_f64() * 1000.0;

    let request: ExecutePayload = match envelope.into_payload() {
        Ok(request) => request,
        Err(e) => {
            return Envelope::error(
                task_id,
                ErrorPayload {
                    message: format!("Malformed execute payload: {}", e),
                    stack: None,
                    function_name: None,
                    duration: None,
                },
            )
        }
    };

    let Some(function) = table.get(&request.function_name) else {
        return Envelope::error(
            task_id,
            ErrorPayload {
                message: format!("Function '{}' is not available in this context", request.function_name),
                stack: None,
                function_name: Some(request.function_name),
                duration: None,
            },
        );
    };

    let scope = TaskScope::new(
        task_id.clone(),
        replies.clone(),
        bound.clone(),
        loader.clone(),
        shared.clone(),
    );

    match function.call(request.input, scope).await {
        Ok(data) => {
            let output_size = payload::estimate_size(&data);
            Envelope::result(
                task_id,
                ResultPayload {
                    data,
                    duration: elapsed_ms(started),
                    output_size: Some(output_size),
                },
            )
        }
        Err(error) => Envelope::error(
            task_id,
            ErrorPayload {
                message: error.message,
                stack: error.stack,
                function_name: Some(request.function_name),
                duration: Some(elapsed_ms(started)),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::registry::FunctionRegistry;
    use crate::traits::{from_fn, FunctionError};
    use serde_json::{json, Value};
    use std::io::Write;
    use std::time::Duration;

    fn bootstrap(table: Arc<FunctionTable>, dependencies: Vec<RemoteDependency>) -> ContextBootstrap {
        ContextBootstrap {
            table,
            dependencies,
            aliases: HashMap::new(),
            loader: Arc::new(WasmLoader::new().unwrap()),
            shared: None,
        }
    }

    fn table() -> Arc<FunctionTable> {
        let mut registry = FunctionRegistry::default();
        registry.register(
            "double".into(),
            Arc::new(from_fn(|x: Value| {
                x.as_i64()
                    .map(|n| json!(n * 2))
                    .ok_or_else(|| FunctionError::new("not a number"))
            })),
        );
        registry.snapshot()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_handshake_then_execute() {
        let (handle, mut replies) = spawn(1, 0, bootstrap(table(), vec![])).unwrap();

        let ready = next(&mut replies).await.unwrap();
        assert_eq!(ready.kind, MessageType::Ready);
        let payload: ReadyPayload = ready.into_payload().unwrap();
        assert_eq!(payload.context_id, 1);
        assert_eq!(payload.functions, vec!["double"]);

        handle
            .send(Envelope::execute(
                "task-1",
                ExecutePayload {
                    function_name: "double".into(),
                    input: json!(21),
                },
            ))
            .unwrap();
        let reply = next(&mut replies).await.unwrap();
        assert_eq!(reply.kind, MessageType::Result);
        assert_eq!(reply.id, "task-1");
        let result: ResultPayload = reply.into_payload().unwrap();
        assert_eq!(result.data, json!(42));
        assert_eq!(result.output_size, Some(2));
    }

    #[tokio::test]
    async fn test_function_error_becomes_error_message() {
        let (handle, mut replies) = spawn(2, 0, bootstrap(table(), vec![])).unwrap();
        next(&mut replies).await.unwrap();

        handle
            .send(Envelope::execute(
                "task-9",
                ExecutePayload {
                    function_name: "double".into(),
                    input: json!("nope"),
                },
            ))
            .unwrap();
        let reply = next(&mut replies).await.unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        let error: ErrorPayload = reply.into_payload().unwrap();
        assert_eq!(error.message, "not a number");
        assert_eq!(error.function_name.as_deref(), Some("double"));
        assert!(error.duration.is_some());
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_context() {
        let (handle, mut replies) = spawn(3, 0, bootstrap(table(), vec![])).unwrap();
        next(&mut replies).await.unwrap();

        drop(handle);

        assert!(next(&mut replies).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_dependency_exits_before_ready() {
        let dependency = RemoteDependency::new("/definitely/not/here.wasm");
        let (_handle, mut replies) = spawn(4, 0, bootstrap(table(), vec![dependency])).unwrap();

        assert!(next(&mut replies).await.is_none());
    }

    #[test]
    fn test_alias_pass() {
        let wasm = wat::parse_str(r#"(module (func (export "one") (result i32) i32.const 1))"#).unwrap();
        let mut file = tempfile::Builder::new().suffix(".wasm").tempfile().unwrap();
        file.write_all(&wasm).unwrap();
        let source = file.path().display().to_string();

        let loader = WasmLoader::new().unwrap();
        let dependencies = vec![
            RemoteDependency::new(source.clone()).named("math"),
        ];
        let mut aliases = HashMap::new();
        aliases.insert(source.clone(), "numbers".to_string());

        let bound = load_dependencies(&loader, &dependencies, &aliases).unwrap();
        assert!(bound.contains("math"));
        assert!(bound.contains("numbers"));
        assert_eq!(bound.get("numbers").unwrap().global_name, "math");

        // An alias equal to the global name or already bound is left alone
        aliases.insert(source, "math".to_string());
        let bound = load_dependencies(&loader, &dependencies, &aliases).unwrap();
        assert!(bound.contains("math"));
        assert!(!bound.contains("numbers"));
    }
}
