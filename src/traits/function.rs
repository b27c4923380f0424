// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The contract every registered function implements.
//!
//! Functions never cross the isolation boundary as code. Each context receives an immutable table
//! of `Arc<dyn ComputeFunction>` handles when it is created, and the only things that travel
//! between the pool and a context afterwards are JSON values inside message envelopes.
//!
//! # Examples
//!
//! ```rust
//! use the_offload::traits::{from_fn, typed, FunctionError};
//! use serde_json::{json, Value};
//!
//! // Untyped: works on raw JSON values
//! let double = from_fn(|x: Value| {
//!     x.as_i64()
//!         .map(|n| json!(n * 2))
//!         .ok_or_else(|| FunctionError::new("expected an integer"))
//! });
//!
//! // Typed: input and output are checked against serde types
//! let square = typed(|x: i64| Ok::<_, FunctionError>(x * x));
//! # let _ = (double, square);
//! ```

use crate::pool::TaskScope;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

/// Error returned by a registered function. Travels back to the caller as `PoolError::TaskExecution`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
    pub stack: Option<String>,
}

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach extra diagnostic context (a backtrace, a chain of causes).
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<&str> for FunctionError {
    fn from(message: &str) -> Self {
        FunctionError::new(message)
    }
}

impl From<String> for FunctionError {
    fn from(message: String) -> Self {
        FunctionError::new(message)
    }
}

impl From<serde_json::Error> for FunctionError {
    fn from(error: serde_json::Error) -> Self {
        FunctionError::new(error.to_string())
    }
}

impl From<crate::wasm::WasmError> for FunctionError {
    fn from(error: crate::wasm::WasmError) -> Self {
        FunctionError::new(error.to_string())
    }
}

/// A named unit of work that runs inside an isolation context.
///
/// `call` may await; the context awaits it before replying. A panic inside `call` is treated as a
/// fatal context fault: the context is discarded and replaced, and only the task that was running
/// on it fails.
#[async_trait]
pub trait ComputeFunction: Send + Sync {
    async fn call(&self, input: Value, scope: TaskScope) -> Result<Value, FunctionError>;
}

/// Adapter for a synchronous closure over JSON values.
pub struct FnFunction<F> {
    f: F,
}

#[async_trait]
impl<F> ComputeFunction for FnFunction<F>
where
    F: Fn(Value) -> Result<Value, FunctionError> + Send + Sync,
{
    async fn call(&self, input: Value, _scope: TaskScope) -> Result<Value, FunctionError> {
        (self.f)(input)
    }
}

/// Wrap a synchronous closure.
pub fn from_fn<F>(f: F) -> FnFunction<F>
where
    F: Fn(Value) -> Result<Value, FunctionError> + Send + Sync,
{
    FnFunction { f }
}

/// Adapter for a closure returning a future; the closure also receives the task scope.
pub struct AsyncFnFunction<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ComputeFunction for AsyncFnFunction<F, Fut>
where
    F: Fn(Value, TaskScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FunctionError>> + Send,
{
    async fn call(&self, input: Value, scope: TaskScope) -> Result<Value, FunctionError> {
        (self.f)(input, scope).await
    }
}

/// Wrap an async closure. Use this when the function reports progress or awaits timers.
pub fn from_async_fn<F, Fut>(f: F) -> AsyncFnFunction<F, Fut>
where
    F: Fn(Value, TaskScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FunctionError>> + Send,
{
    AsyncFnFunction {
        f,
        _future: PhantomData,
    }
}

/// Adapter for a closure with serde-typed input and output.
///
/// The input is deserialized before the closure runs and the output serialized after, so a value
/// that does not match the declared types is rejected with a `FunctionError` instead of reaching
/// the closure or the caller.
pub struct TypedFunction<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<F, I, O, E> ComputeFunction for TypedFunction<F, I, O>
where
    F: Fn(I) -> Result<O, E> + Send + Sync,
    I: DeserializeOwned + 'static,
    O: Serialize + 'static,
    E: Into<FunctionError> + 'static,
{
    async fn call(&self, input: Value, _scope: TaskScope) -> Result<Value, FunctionError> {
        let input: I = serde_json::from_value(input)
            .map_err(|e| FunctionError::new(format!("Input does not match the function's schema: {}", e)))?;
        let output = (self.f)(input).map_err(Into::into)?;
        serde_json::to_value(output)
            .map_err(|e| FunctionError::new(format!("Output could not be serialized: {}", e)))
    }
}

/// Wrap a typed closure.
pub fn typed<F, I, O, E>(f: F) -> TypedFunction<F, I, O>
where
    F: Fn(I) -> Result<O, E> + Send + Sync,
    I: DeserializeOwned,
    O: Serialize,
    E: Into<FunctionError>,
{
    TypedFunction {
        f,
        _types: PhantomData,
    }
}
