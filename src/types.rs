use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use crate::messages::{ExecutionErrorData, EXECUTION_ERROR};
use crate::workflow::Workflow;

/// Storage class of a file on the ComfyUI server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Input,
    #[default]
    Output,
    Temp,
}

impl FolderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderType::Input => "input",
            FolderType::Output => "output",
            FolderType::Temp => "temp",
        }
    }
}

/// Reference to an image stored in one of ComfyUI's folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: FolderType,
}

/// Artifacts produced by one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Entries without an image shape (e.g. no `filename`) are dropped.
    #[serde(default, deserialize_with = "lenient_images")]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub text: Vec<String>,
    /// Any other output kinds (`gifs`, `latents`, custom node payloads).
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

fn lenient_images<'de, D>(deserializer: D) -> std::result::Result<Vec<ImageRef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Execution status stored alongside a history entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// Raw `[kind, payload]` pairs as recorded by the server.
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str == "error"
    }

    /// Whether the server is done with this prompt, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.completed || self.is_error()
    }

    /// The recorded `execution_error` payload, if the prompt failed.
    pub fn execution_error(&self) -> Option<ExecutionErrorData> {
        self.messages.iter().find_map(|message| match message.as_array()?.as_slice() {
            [kind, payload] if kind.as_str() == Some(EXECUTION_ERROR) => {
                serde_json::from_value(payload.clone()).ok()
            }
            _ => None,
        })
    }
}

/// The positional `[number, prompt_id, prompt, extra_data, outputs_to_execute]`
/// tuple shared by history entries and queue slots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptRecord {
    pub number: i64,
    pub prompt_id: String,
    pub workflow: Workflow,
    pub extra_data: Option<Map<String, Value>>,
    pub outputs_to_execute: Option<Vec<String>>,
}

/// One entry of `/history`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryEntry {
    pub prompt: PromptRecord,
    pub outputs: BTreeMap<String, NodeOutput>,
    pub status: HistoryStatus,
}

impl HistoryEntry {
    /// All images across every output node.
    pub fn images(&self) -> Vec<ImageRef> {
        self.outputs
            .values()
            .flat_map(|o| o.images.iter().cloned())
            .collect()
    }
}

/// Decoded `/history` response keyed by prompt id.
pub type History = BTreeMap<String, HistoryEntry>;

/// Decoded `/queue` response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub running: Vec<PromptRecord>,
    pub pending: Vec<PromptRecord>,
}

impl QueueSnapshot {
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|r| r.prompt_id == prompt_id)
    }

    /// Zero-based position of a prompt among the pending slots, in server
    /// execution order (lowest `number` first).
    pub fn pending_position(&self, prompt_id: &str) -> Option<usize> {
        let mut pending: Vec<&PromptRecord> = self.pending.iter().collect();
        pending.sort_by_key(|r| r.number);
        pending.iter().position(|r| r.prompt_id == prompt_id)
    }
}

/// Response of `POST /prompt`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub node_errors: Map<String, Value>,
}

/// Final result of a prompt that ran to completion.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub prompt_id: String,
    pub images: Vec<ImageRef>,
    pub outputs: BTreeMap<String, NodeOutput>,
    pub status: HistoryStatus,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration: Duration,
}

/// Options for `POST /upload/image`.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub subfolder: Option<String>,
    /// Destination folder; the server default is `input`.
    pub folder_type: Option<FolderType>,
    pub overwrite: bool,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub folder_type: FolderType,
}

impl UploadResponse {
    /// Reference usable as a `LoadImage` input or for [`crate::ComfyClient::image`].
    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            filename: self.name.clone(),
            subfolder: self.subfolder.clone(),
            folder_type: self.folder_type,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub python_version: String,
    #[serde(default)]
    pub embedded_python: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub index: Option<i64>,
    #[serde(default)]
    pub vram_total: u64,
    #[serde(default)]
    pub vram_free: u64,
    #[serde(default)]
    pub torch_vram_total: u64,
    #[serde(default)]
    pub torch_vram_free: u64,
}

/// Node class description from `/object_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeClassInfo {
    #[serde(default)]
    pub input: NodeInputInfo,
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default)]
    pub output_name: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub output_node: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInputInfo {
    #[serde(default)]
    pub required: Map<String, Value>,
    #[serde(default)]
    pub optional: Map<String, Value>,
    #[serde(default)]
    pub hidden: Map<String, Value>,
}

/// `/object_info` keyed by node class name.
pub type ObjectInfo = BTreeMap<String, NodeClassInfo>;
