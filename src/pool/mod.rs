// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Worker pool: runs registered functions in isolated execution contexts.
//!
//! * [`WorkerPool`] - registry, scheduler and context lifecycle
//! * [`TaskOptions`] - per-call timeout, priority, cancellation and progress
//! * [`TaskScope`] - what a running function can see of its context
//! * [`payload`] - binary buffers inside JSON payloads

mod context;
mod queue;
mod registry;
mod scope;
mod shared;
mod stats;
mod task;
mod worker_pool;

pub mod payload;


pub use context::{ContextId, ContextRecord, ContextState};
pub use registry::FunctionTable;
pub use scope::{LoadedDependency, TaskScope};
pub use shared::SharedRegion;
pub use stats::PoolStats;
pub use task::{ProgressCallback, TaskId, TaskOptions};
pub use worker_pool::WorkerPool;
