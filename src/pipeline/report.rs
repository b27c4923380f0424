// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Read-only run report: a projection of recorded stage state and the timeline.

use super::events::PipelineStatus;
use super::stage::{StageState, StageStatus};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Started,
    Completed,
    Failed,
    Skipped,
    Retrying,
    Cancelled,
}

/// One stage transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub stage_id: String,
    pub stage_index: usize,
    pub kind: TimelineKind,
    /// Milliseconds since the first run of this pipeline state started.
    pub at_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub id: String,
    pub name: String,
    pub function_name: String,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub slowest_stage: Option<String>,
    pub fastest_stage: Option<String>,
    pub total_retries: u32,
    pub average_stage_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub name: String,
    pub status: PipelineStatus,
    pub total_duration_ms: f64,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageReport>,
    pub timeline: Vec<TimelineEvent>,
    pub insights: Insights,
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

impl PipelineReport {
    pub(crate) fn build(
        name: &str,
        status: PipelineStatus,
        total_duration: Duration,
        progress: f64,
        error: Option<String>,
        stages: &[StageState],
        timeline: &[TimelineEvent],
    ) -> Self {
        let rows = stages
            .iter()
            .map(|stage| StageReport {
                id: stage.id.clone(),
                name: stage.name.clone(),
                function_name: stage.function_name.clone(),
                status: stage.status,
                duration_ms: stage.duration.map(millis),
                retry_count: stage.retry_count,
                error: stage.error.as_ref().map(ToString::to_string),
            })
            .collect();

        Self {
            name: name.to_string(),
            status,
            total_duration_ms: millis(total_duration),
            progress,
            error,
            stages: rows,
            timeline: timeline.to_vec(),
            insights: insights(stages),
        }
    }
}

fn insights(stages: &[StageState]) -> Insights {
    let timed: Vec<(&str, Duration)> = stages
        .iter()
        .filter_map(|stage| stage.duration.map(|d| (stage.id.as_str(), d)))
        .collect();

    let slowest = timed.iter().max_by_key(|(_, d)| *d).map(|(id, _)| id.to_string());
    let fastest = timed.iter().min_by_key(|(_, d)| *d).map(|(id, _)| id.to_string());
    let average = if timed.is_empty() {
        0.0
    } else {
        timed.iter().map(|(_, d)| millis(*d)).sum::<f64>() / timed.len() as f64
    };

    Insights {
        slowest_stage: slowest,
        fastest_stage: fastest,
        total_retries: stages.iter().map(|s| s.retry_count).sum(),
        average_stage_duration_ms: average,
    }
}
