// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message envelope exchanged between the pool and its isolation contexts.
//!
//! The envelope is the only channel between the orchestrator and a context. Its JSON form is:
//!
//! ```text
//! { "id": "task-7", "type": "execute", "payload": { "functionName": "double", "input": 21 }, "timestamp": 1700000000000 }
//! ```
//!
//! # Message kinds
//!
//! * `init` - pool -> context, first message after spawn
//! * `ready` - context -> pool, sent once after bootstrap
//! * `execute` - pool -> context, run a registered function
//! * `result` / `error` - context -> pool, one per `execute`
//! * `progress` - context -> pool, zero or more per `execute`
//!
//! # Examples
//!
//! ```rust
//! use the_offload::protocol::{Envelope, ExecutePayload, MessageType};
//!
//! let envelope = Envelope::execute("task-1", ExecutePayload {
//!     function_name: "double".to_string(),
//!     input: serde_json::json!(21),
//! });
//! let wire = envelope.to_wire().unwrap();
//! let decoded = Envelope::from_wire(&wire).unwrap();
//! assert_eq!(decoded.kind, MessageType::Execute);
//! assert_eq!(decoded.payload_as::<ExecutePayload>().unwrap().function_name, "double");
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Execute,
    Result,
    Error,
    Progress,
    Ready,
    Init,
}

/// Tagged message envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: u64,
}

impl Envelope {
    fn with_payload<P: Serialize>(id: impl Into<String>, kind: MessageType, payload: P) -> Self {
        Self {
            id: id.into(),
            kind,
            // Payload structs hold only strings, numbers and `Value`s, so this cannot fail.
            payload: serde_json::to_value(payload).ok(),
            timestamp: now_millis(),
        }
    }

    pub fn init(id: impl Into<String>, payload: InitPayload) -> Self {
        Self::with_payload(id, MessageType::Init, payload)
    }

    pub fn ready(id: impl Into<String>, payload: ReadyPayload) -> Self {
        Self::with_payload(id, MessageType::Ready, payload)
    }

    /// Build an `execute` message. The input is moved into the envelope, not copied.
    pub fn execute(id: impl Into<String>, payload: ExecutePayload) -> Self {
        let payload = Value::Object(
            [
                ("functionName".to_string(), Value::String(payload.function_name)),
                ("input".to_string(), payload.input),
            ]
            .into_iter()
            .collect(),
        );
        Self {
            id: id.into(),
            kind: MessageType::Execute,
            payload: Some(payload),
            timestamp: now_millis(),
        }
    }

    pub fn result(id: impl Into<String>, payload: ResultPayload) -> Self {
        Self::with_payload(id, MessageType::Result, payload)
    }

    pub fn error(id: impl Into<String>, payload: ErrorPayload) -> Self {
        Self::with_payload(id, MessageType::Error, payload)
    }

    pub fn progress(id: impl Into<String>, payload: ProgressPayload) -> Self {
        Self::with_payload(id, MessageType::Progress, payload)
    }

    /// Decode the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.payload.as_ref().unwrap_or(&Value::Null))
    }

    /// Decode the payload by value, avoiding a clone of large inputs.
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.unwrap_or(Value::Null))
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_wire(wire: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(wire)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub context_id: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub context_id: u32,
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub function_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub data: Value,
    /// Wall time spent inside the function, in milliseconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub task_id: String,
    pub progress: Progress,
}

/// Intermediate progress reported by a running function.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// 0 to 100.
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Progress {
    pub fn percent(percent: f64) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            ..Default::default()
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_estimate(mut self, remaining_ms: u64) -> Self {
        self.estimated_time_remaining = Some(remaining_ms);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
