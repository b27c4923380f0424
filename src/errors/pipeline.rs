// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::errors::PoolError;
use thiserror::Error;

/// Errors returned by a pipeline run.
///
/// With `stop_on_error = false` a failing stage does not produce an error here; the run completes and
/// the failure is reported through the run state and `PipelineOutput::failed_stages`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A stage exhausted its retries.
    #[error("Stage '{stage_id}' failed after {attempts} attempt(s): {source}")]
    StageFailure {
        stage_id: String,
        attempts: u32,
        #[source]
        source: PoolError,
    },

    /// The run was cancelled, either explicitly or by a newer run.
    #[error("Pipeline run was cancelled")]
    PipelineCancelled,

    /// `retry()` was called but no stage is in the failed state.
    #[error("No failed stage to retry")]
    NothingToRetry,

    /// `retry()` was called while a run is still active.
    #[error("A pipeline run is already in progress")]
    AlreadyRunning,
}
