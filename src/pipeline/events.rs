// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::errors::PoolError;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    /// Running or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineStatus::Running | PipelineStatus::Paused)
    }
}

/// Lifecycle notifications, delivered through `Pipeline::subscribe`.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RunStarted {
        run_id: u64,
        start_index: usize,
    },
    StageStarted {
        stage_id: String,
        index: usize,
        attempt: u32,
    },
    StageProgress {
        stage_id: String,
        index: usize,
        /// 0.0 to 1.0 for the stage alone.
        stage_progress: f64,
        /// 0.0 to 1.0 for the whole run.
        overall: f64,
    },
    StageCompleted {
        stage_id: String,
        index: usize,
        duration: Duration,
    },
    StageSkipped {
        stage_id: String,
        index: usize,
    },
    StageRetrying {
        stage_id: String,
        index: usize,
        retry_count: u32,
        error: PoolError,
    },
    StageFailed {
        stage_id: String,
        index: usize,
        error: PoolError,
    },
    Paused,
    Resumed,
    Cancelled,
    RunFinished {
        run_id: u64,
        status: PipelineStatus,
    },
}
