// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use crate::config::StageDefinition;
use crate::errors::PoolError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builds a stage's input from the carried value and the outputs recorded so far.
pub type InputTransform = Arc<dyn Fn(&Value, &[Value]) -> Value + Send + Sync>;
pub type OutputTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;
/// Returns true to skip the stage for this carried value and these prior outputs.
pub type SkipPredicate = Arc<dyn Fn(&Value, &[Value]) -> bool + Send + Sync>;

/// Immutable description of one pipeline step.
///
/// # Examples
///
/// ```rust
/// use the_offload::pipeline::StageConfig;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let stage = StageConfig::new("resize", "resize_image")
///     .named("Resize")
///     .with_retries(2, Duration::from_millis(100))
///     .transform_input(|carry, _previous| json!({ "image": carry, "width": 640 }))
///     .skip_when(|carry, _previous| carry.is_null());
/// assert_eq!(stage.max_retries, 2);
/// ```
#[derive(Clone)]
pub struct StageConfig {
    pub id: String,
    pub name: String,
    pub function_name: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
    pub priority: Option<u8>,
    transform_input: Option<InputTransform>,
    transform_output: Option<OutputTransform>,
    should_skip: Option<SkipPredicate>,
}

impl StageConfig {
    pub fn new(id: impl Into<String>, function_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            function_name: function_name.into(),
            max_retries: 0,
            retry_delay: Duration::ZERO,
            timeout: None,
            priority: None,
            transform_input: None,
            transform_output: None,
            should_skip: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn transform_input<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.transform_input = Some(Arc::new(f));
        self
    }

    pub fn transform_output<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_output = Some(Arc::new(f));
        self
    }

    pub fn skip_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> bool + Send + Sync + 'static,
    {
        self.should_skip = Some(Arc::new(f));
        self
    }

    pub(crate) fn should_skip(&self, carry: &Value, previous: &[Value]) -> bool {
        self.should_skip.as_ref().is_some_and(|skip| skip(carry, previous))
    }

    pub(crate) fn prepare_input(&self, carry: &Value, previous: &[Value]) -> Value {
        match &self.transform_input {
            Some(transform) => transform(carry, previous),
            None => carry.clone(),
        }
    }

    pub(crate) fn finish_output(&self, output: Value) -> Value {
        match &self.transform_output {
            Some(transform) => transform(output),
            None => output,
        }
    }
}

impl From<&StageDefinition> for StageConfig {
    fn from(definition: &StageDefinition) -> Self {
        let mut stage = StageConfig::new(definition.id.clone(), definition.function.clone())
            .with_retries(definition.max_retries, Duration::from_millis(definition.retry_delay_ms));
        if let Some(name) = &definition.name {
            stage = stage.named(name.clone());
        }
        if let Some(timeout_ms) = definition.timeout_ms {
            stage = stage.with_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(priority) = definition.priority {
            stage = stage.with_priority(priority);
        }
        stage
    }
}

impl fmt::Debug for StageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("function_name", &self.function_name)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("transform_input", &self.transform_input.is_some())
            .field("transform_output", &self.transform_output.is_some())
            .field("should_skip", &self.should_skip.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Runtime state of one stage, owned by the pipeline driving it.
#[derive(Debug, Clone)]
pub struct StageState {
    pub id: String,
    pub name: String,
    pub function_name: String,
    pub status: StageStatus,
    pub input: Option<Value>,
    /// For a skipped stage this is the carried value it passed through.
    pub output: Option<Value>,
    pub error: Option<PoolError>,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub duration: Option<Duration>,
    /// 0.0 to 1.0.
    pub progress: f64,
    pub retry_count: u32,
}

impl StageState {
    pub(crate) fn pending(config: &StageConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            function_name: config.function_name.clone(),
            status: StageStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            duration: None,
            progress: 0.0,
            retry_count: 0,
        }
    }

    /// Completed and skipped stages both contribute an output to the run.
    pub fn is_settled(&self) -> bool {
        matches!(self.status, StageStatus::Completed | StageStatus::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_identity() {
        let stage = StageConfig::new("inc", "add_one");

        assert_eq!(stage.name, "inc");
        assert!(!stage.should_skip(&json!(1), &[]));
        assert_eq!(stage.prepare_input(&json!(1), &[]), json!(1));
        assert_eq!(stage.finish_output(json!(2)), json!(2));
    }

    #[test]
    fn test_closures_see_previous_results() {
        let stage = StageConfig::new("sum", "identity")
            .transform_input(|carry, previous| {
                let total: i64 = previous.iter().filter_map(Value::as_i64).sum();
                json!(carry.as_i64().unwrap_or(0) + total)
            })
            .transform_output(|output| json!({ "wrapped": output }))
            .skip_when(|_carry, previous| previous.len() > 2);

        assert_eq!(stage.prepare_input(&json!(1), &[json!(2), json!(3)]), json!(6));
        assert_eq!(stage.finish_output(json!(6)), json!({ "wrapped": 6 }));
        assert!(stage.should_skip(&json!(0), &[json!(1), json!(2), json!(3)]));
    }

    #[test]
    fn test_from_definition() {
        let definition = StageDefinition {
            id: "dbl".into(),
            name: Some("Double".into()),
            function: "double".into(),
            max_retries: 3,
            retry_delay_ms: 250,
            timeout_ms: Some(1_000),
            priority: Some(8),
        };

        let stage = StageConfig::from(&definition);

        assert_eq!(stage.id, "dbl");
        assert_eq!(stage.name, "Double");
        assert_eq!(stage.function_name, "double");
        assert_eq!(stage.max_retries, 3);
        assert_eq!(stage.retry_delay, Duration::from_millis(250));
        assert_eq!(stage.timeout, Some(Duration::from_secs(1)));
        assert_eq!(stage.priority, Some(8));
    }
}
