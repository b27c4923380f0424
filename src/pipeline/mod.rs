// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Pipeline orchestrator: ordered stages executed on the worker pool with retries, skips,
//! pause/resume, cancellation and a run report.

mod events;
mod orchestrator;
mod report;
mod stage;

mod integration_tests;

pub use events::{PipelineEvent, PipelineStatus};
pub use orchestrator::{Pipeline, PipelineOptions, PipelineOutput};
pub use report::{Insights, PipelineReport, StageReport, TimelineEvent, TimelineKind};
pub use stage::{InputTransform, OutputTransform, SkipPredicate, StageConfig, StageState, StageStatus};
