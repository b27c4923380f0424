// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors surfaced by the worker pool to the caller of `execute`.

use std::time::Duration;
use thiserror::Error;

/// Every way a single task can end without a result.
///
/// Task-level variants (`TaskExecution`, `TaskTimeout`, `TaskCancelled`) only ever reach the caller
/// that issued the task. `WorkerFault` reaches the caller whose task was running on a context that
/// died outside the reply protocol; the pool itself recovers by replacing the context.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// No function with this name is registered.
    #[error("Function '{function_name}' is not registered")]
    FunctionNotRegistered { function_name: String },

    /// The registered function itself returned an error.
    #[error("Task '{function_name}' failed: {message}")]
    TaskExecution {
        function_name: String,
        message: String,
        stack: Option<String>,
    },

    /// The deadline elapsed before the context replied.
    #[error("Task '{function_name}' timed out after {timeout:?}")]
    TaskTimeout {
        function_name: String,
        timeout: Duration,
    },

    /// The caller's cancellation signal fired.
    #[error("Task '{function_name}' was cancelled")]
    TaskCancelled { function_name: String },

    /// The isolation context running the task died.
    #[error("Isolation context {context_id} failed: {reason}")]
    WorkerFault { context_id: u32, reason: String },

    /// The pool was terminated while the task was outstanding.
    #[error("Worker pool was terminated")]
    PoolTerminated,
}

impl PoolError {
    /// True for the cancellation variant, used by callers layered on top of the pool.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::TaskCancelled { .. })
    }

    /// True for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::TaskTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_function_name() {
        let error = PoolError::TaskExecution {
            function_name: "double".to_string(),
            message: "boom".to_string(),
            stack: None,
        };
        assert_eq!(error.to_string(), "Task 'double' failed: boom");

        let error = PoolError::FunctionNotRegistered {
            function_name: "doesNotExist".to_string(),
        };
        assert!(error.to_string().contains("doesNotExist"));
    }

    #[test]
    fn test_classification_helpers() {
        let cancelled = PoolError::TaskCancelled {
            function_name: "f".to_string(),
        };
        let timeout = PoolError::TaskTimeout {
            function_name: "f".to_string(),
            timeout: Duration::from_millis(10),
        };
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_timeout());
        assert!(timeout.is_timeout());
        assert!(!PoolError::PoolTerminated.is_cancelled());
    }
}
