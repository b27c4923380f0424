// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use super::shared::SharedRegion;
use super::task::TaskId;
use crate::protocol::{Envelope, Progress, ProgressPayload};
use crate::wasm::{WasmInstance, WasmLoader, WasmResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use wasmtime::Module;

/// A remote dependency compiled and bound inside an isolation context.
#[derive(Debug, Clone)]
pub struct LoadedDependency {
    pub global_name: String,
    pub source: String,
    pub module: Module,
}

/// Dependencies bound in one context, by global name and alias.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dependencies(HashMap<String, Arc<LoadedDependency>>);

impl Dependencies {
    pub fn bind(&mut self, name: String, dependency: Arc<LoadedDependency>) {
        self.0.insert(name, dependency);
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadedDependency>> {
        self.0.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

/// What a running function can see of its isolation context.
#[derive(Clone)]
pub struct TaskScope {
    task_id: TaskId,
    replies: UnboundedSender<Envelope>,
    dependencies: Arc<Dependencies>,
    loader: Arc<WasmLoader>,
    shared: Option<SharedRegion>,
}

impl TaskScope {
    pub(crate) fn new(
        task_id: TaskId,
        replies: UnboundedSender<Envelope>,
        dependencies: Arc<Dependencies>,
        loader: Arc<WasmLoader>,
        shared: Option<SharedRegion>,
    ) -> Self {
        Self {
            task_id,
            replies,
            dependencies,
            loader,
            shared,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Send a progress message for this task. Dropped silently once the pool stops listening.
    pub fn report_progress(&self, progress: Progress) {
        let payload = ProgressPayload {
            task_id: self.task_id.clone(),
            progress,
        };
        let _ = self.replies.send(Envelope::progress(self.task_id.clone(), payload));
    }

    /// A dependency bound under `name`, either its global name or an alias.
    pub fn dependency(&self, name: &str) -> Option<Arc<LoadedDependency>> {
        self.dependencies.get(name)
    }

    /// Instantiate a bound dependency in a fresh store. `Ok(None)` when nothing is bound under `name`.
    pub fn instantiate(&self, name: &str) -> WasmResult<Option<WasmInstance>> {
        match self.dependencies.get(name) {
            Some(dependency) => self.loader.instantiate(&dependency.module).map(Some),
            None => Ok(None),
        }
    }

    pub fn shared_region(&self) -> Option<&SharedRegion> {
        self.shared.as_ref()
    }
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("task_id", &self.task_id)
            .field("shared_region", &self.shared.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use tokio::sync::mpsc;

    #[test]
    fn test_report_progress_sends_envelope_for_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loader = Arc::new(WasmLoader::new().unwrap());
        let scope = TaskScope::new("task-7".into(), tx, Arc::default(), loader, None);

        scope.report_progress(Progress::percent(40.0).with_phase("decode"));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.kind, MessageType::Progress);
        assert_eq!(envelope.id, "task-7");
        let payload: ProgressPayload = envelope.into_payload().unwrap();
        assert_eq!(payload.task_id, "task-7");
        assert_eq!(payload.progress.percent, 40.0);
        assert_eq!(payload.progress.phase.as_deref(), Some("decode"));
    }

    #[test]
    fn test_unbound_dependency() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let loader = Arc::new(WasmLoader::new().unwrap());
        let scope = TaskScope::new("task-1".into(), tx, Arc::default(), loader, None);

        assert!(scope.dependency("math").is_none());
        assert!(scope.instantiate("math").unwrap().is_none());
        assert!(scope.shared_region().is_none());
    }
}
