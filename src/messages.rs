//! ComfyUI event-stream message types and decoder.
//!
//! ComfyUI pushes JSON frames shaped `{"type": "<kind>", "data": {...}}`.
//! [`EventMessage`] keeps the raw kind and payload; its typed accessors
//! project the payload for one kind, and [`EventMessage::classify`] turns
//! it into a [`ServerEvent`]. Unrecognised kinds are preserved as
//! [`ServerEvent::Unknown`] rather than rejected.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ComfyError, Result};
use crate::types::ImageRef;

pub const STATUS: &str = "status";
pub const EXECUTING: &str = "executing";
pub const PROGRESS: &str = "progress";
pub const EXECUTED: &str = "executed";
pub const EXECUTION_CACHED: &str = "execution_cached";
pub const EXECUTION_ERROR: &str = "execution_error";

/// One raw event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl EventMessage {
    /// Decode one frame. Malformed JSON or a missing `type` is an error.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The `prompt_id` carried by the payload, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        self.data.get("prompt_id").and_then(Value::as_str)
    }

    pub fn status(&self) -> Result<StatusData> {
        self.payload(STATUS)
    }

    pub fn executing(&self) -> Result<ExecutingData> {
        self.payload(EXECUTING)
    }

    pub fn progress(&self) -> Result<ProgressData> {
        self.payload(PROGRESS)
    }

    pub fn executed(&self) -> Result<ExecutedData> {
        self.payload(EXECUTED)
    }

    pub fn execution_cached(&self) -> Result<ExecutionCachedData> {
        self.payload(EXECUTION_CACHED)
    }

    pub fn execution_error(&self) -> Result<ExecutionErrorData> {
        self.payload(EXECUTION_ERROR)
    }

    /// Project into a typed [`ServerEvent`].
    pub fn classify(self) -> Result<ServerEvent> {
        Ok(match self.kind.as_str() {
            STATUS => ServerEvent::Status(self.status()?),
            EXECUTING => ServerEvent::Executing(self.executing()?),
            PROGRESS => ServerEvent::Progress(self.progress()?),
            EXECUTED => ServerEvent::Executed(self.executed()?),
            EXECUTION_CACHED => ServerEvent::ExecutionCached(self.execution_cached()?),
            EXECUTION_ERROR => ServerEvent::ExecutionError(self.execution_error()?),
            _ => ServerEvent::Unknown(self),
        })
    }

    fn payload<T: DeserializeOwned>(&self, expected: &'static str) -> Result<T> {
        if self.kind != expected {
            return Err(ComfyError::WrongKind {
                expected,
                actual: self.kind.clone(),
            });
        }
        T::deserialize(&self.data).map_err(|e| ComfyError::MalformedEvent {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// Parse and classify one frame in a single step.
pub fn decode_event(bytes: &[u8]) -> Result<ServerEvent> {
    EventMessage::parse(bytes)?.classify()
}

/// A classified event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Queue depth broadcast.
    Status(StatusData),
    /// A node started; `node == None` means the whole prompt finished.
    Executing(ExecutingData),
    /// Step counter of the running node (e.g. a sampler loop).
    Progress(ProgressData),
    /// A node finished and produced outputs.
    Executed(ExecutedData),
    /// Nodes skipped because their results were cached.
    ExecutionCached(ExecutionCachedData),
    ExecutionError(ExecutionErrorData),
    /// A kind this crate does not model, payload untouched.
    Unknown(EventMessage),
}

impl ServerEvent {
    pub fn kind(&self) -> &str {
        match self {
            ServerEvent::Status(_) => STATUS,
            ServerEvent::Executing(_) => EXECUTING,
            ServerEvent::Progress(_) => PROGRESS,
            ServerEvent::Executed(_) => EXECUTED,
            ServerEvent::ExecutionCached(_) => EXECUTION_CACHED,
            ServerEvent::ExecutionError(_) => EXECUTION_ERROR,
            ServerEvent::Unknown(m) => &m.kind,
        }
    }

    /// The prompt this event belongs to, when the server says so.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Status(_) => None,
            ServerEvent::Executing(d) => Some(&d.prompt_id),
            ServerEvent::Progress(d) => d.prompt_id.as_deref(),
            ServerEvent::Executed(d) => Some(&d.prompt_id),
            ServerEvent::ExecutionCached(d) => d.prompt_id.as_deref(),
            ServerEvent::ExecutionError(d) => Some(&d.prompt_id),
            ServerEvent::Unknown(m) => m.prompt_id(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: Option<QueueInfo>,
    /// Session id assigned by the server on first connect.
    #[serde(default)]
    pub sid: Option<String>,
}

impl StatusData {
    pub fn queue_remaining(&self) -> Option<u32> {
        self.status.as_ref().map(|s| s.exec_info.queue_remaining)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutingData {
    pub prompt_id: String,
    #[serde(default)]
    pub node: Option<String>,
}

impl ExecutingData {
    /// Absent or empty `node` marks the end of the prompt.
    pub fn is_finished(&self) -> bool {
        self.node.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub value: u64,
    pub max: u64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// `value / max` as a percentage in `0..=100`; 0 when `max` is 0.
    pub fn percentage(&self) -> f64 {
        percentage(self.value, self.max)
    }
}

pub(crate) fn percentage(value: u64, max: u64) -> f64 {
    if max == 0 {
        return 0.0;
    }
    (value as f64 / max as f64 * 100.0).min(100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedData {
    pub prompt_id: String,
    pub node: String,
    #[serde(default)]
    pub output: Map<String, Value>,
}

impl ExecutedData {
    /// Image descriptors under `output["images"]`. Entries that do not
    /// look like images are skipped.
    pub fn images(&self) -> Vec<ImageRef> {
        self.output
            .get("images")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload of `execution_error`, also carried by [`ComfyError::Execution`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    #[serde(default)]
    pub exception_type: String,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}
