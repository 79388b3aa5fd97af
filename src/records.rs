//! Decoders for ComfyUI's positional tuple records.
//!
//! The server stores each prompt as a tuple
//! `[number, prompt_id, prompt, extra_data, outputs_to_execute]` and sends
//! it as a bare JSON array both inside `/history` entries (under `"prompt"`)
//! and as each element of `/queue`'s `queue_running` / `queue_pending`
//! lists. Everything that reads that tuple goes through [`decode_prompt_tuple`].

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ComfyError, Result};
use crate::types::{History, HistoryEntry, HistoryStatus, NodeOutput, PromptRecord, QueueSnapshot};
use crate::workflow::{InputValue, Node, Workflow};

const NUMBER: usize = 0;
const PROMPT_ID: usize = 1;
const PROMPT: usize = 2;
const EXTRA_DATA: usize = 3;
const OUTPUTS_TO_EXECUTE: usize = 4;
const MIN_LEN: usize = 3;

/// Which queue list a slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueList {
    Running,
    Pending,
}

impl QueueList {
    pub fn field(&self) -> &'static str {
        match self {
            QueueList::Running => "queue_running",
            QueueList::Pending => "queue_pending",
        }
    }
}

impl fmt::Display for QueueList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Best-effort graph decode: non-object nodes are skipped, a missing
/// `class_type` becomes empty and missing `inputs` become an empty map.
pub fn decode_graph(value: &Value) -> Workflow {
    let Some(obj) = value.as_object() else {
        return Workflow::new();
    };
    obj.iter()
        .filter_map(|(id, node)| {
            let node = node.as_object()?;
            let class_type = node
                .get("class_type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let inputs = node
                .get("inputs")
                .and_then(Value::as_object)
                .map(|inputs| {
                    inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), decode_input(v)))
                        .collect()
                })
                .unwrap_or_default();
            let meta = node.get("_meta").cloned();
            Some((
                id.clone(),
                Node {
                    class_type,
                    inputs,
                    meta,
                },
            ))
        })
        .collect()
}

fn decode_input(value: &Value) -> InputValue {
    serde_json::from_value(value.clone()).unwrap_or_else(|_| InputValue::Literal(value.clone()))
}

/// Decode one positional prompt tuple. `location` names the record in
/// error messages (e.g. `history[abc].prompt`, `queue_pending[2]`).
pub fn decode_prompt_tuple(value: &Value, location: &str) -> Result<PromptRecord> {
    let arr = value.as_array().ok_or_else(|| {
        ComfyError::malformed(location, format!("expected an array, got {}", type_name(value)))
    })?;
    if arr.len() < MIN_LEN {
        return Err(ComfyError::malformed(
            location,
            format!(
                "expected at least {} elements, got {}",
                MIN_LEN,
                arr.len()
            ),
        ));
    }

    let number = arr[NUMBER]
        .as_i64()
        .or_else(|| arr[NUMBER].as_f64().map(|f| f as i64))
        .ok_or_else(|| {
            ComfyError::malformed(
                location,
                format!("position 0 (number) is {}", type_name(&arr[NUMBER])),
            )
        })?;
    let prompt_id = arr[PROMPT_ID].as_str().ok_or_else(|| {
        ComfyError::malformed(
            location,
            format!("position 1 (prompt_id) is {}", type_name(&arr[PROMPT_ID])),
        )
    })?;

    let extra_data = arr
        .get(EXTRA_DATA)
        .and_then(Value::as_object)
        .cloned();
    let outputs_to_execute = arr
        .get(OUTPUTS_TO_EXECUTE)
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        });

    Ok(PromptRecord {
        number,
        prompt_id: prompt_id.to_string(),
        workflow: decode_graph(&arr[PROMPT]),
        extra_data,
        outputs_to_execute,
    })
}

/// Encode a record back into the positional wire form.
pub fn encode_prompt_tuple(record: &PromptRecord) -> Result<Value> {
    let mut arr = vec![
        json!(record.number),
        json!(record.prompt_id),
        record.workflow.to_value()?,
    ];
    if record.extra_data.is_some() || record.outputs_to_execute.is_some() {
        arr.push(
            record
                .extra_data
                .clone()
                .map(Value::Object)
                .unwrap_or_else(|| json!({})),
        );
    }
    if let Some(outputs) = &record.outputs_to_execute {
        arr.push(json!(outputs));
    }
    Ok(Value::Array(arr))
}

/// Decode one queue slot, tagging failures with list and index.
pub fn decode_queue_slot(list: QueueList, index: usize, value: &Value) -> Result<PromptRecord> {
    decode_prompt_tuple(value, &format!("{}[{}]", list, index))
}

/// Decode a `/queue` response. Missing lists are treated as empty.
pub fn decode_queue(value: &Value) -> Result<QueueSnapshot> {
    Ok(QueueSnapshot {
        running: decode_queue_list(value, QueueList::Running)?,
        pending: decode_queue_list(value, QueueList::Pending)?,
    })
}

fn decode_queue_list(value: &Value, list: QueueList) -> Result<Vec<PromptRecord>> {
    match value.get(list.field()) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(slots)) => slots
            .iter()
            .enumerate()
            .map(|(i, slot)| decode_queue_slot(list, i, slot))
            .collect(),
        Some(other) => Err(ComfyError::malformed(
            list.field(),
            format!("expected an array, got {}", type_name(other)),
        )),
    }
}

/// Decode a single `/history` entry (the object stored under a prompt id).
pub fn decode_history_entry(prompt_id: &str, value: &Value) -> Result<HistoryEntry> {
    let location = format!("history[{}]", prompt_id);
    let obj = value.as_object().ok_or_else(|| {
        ComfyError::malformed(&location, format!("expected an object, got {}", type_name(value)))
    })?;

    let prompt = obj.get("prompt").ok_or_else(|| {
        ComfyError::malformed(&location, "missing 'prompt' field")
    })?;
    let prompt = decode_prompt_tuple(prompt, &format!("{}.prompt", location))?;

    let outputs = match obj.get("outputs") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(outputs) => serde_json::from_value::<BTreeMap<String, NodeOutput>>(outputs.clone())
            .map_err(|e| ComfyError::malformed(format!("{}.outputs", location), e.to_string()))?,
    };

    let status = match obj.get("status") {
        None | Some(Value::Null) => HistoryStatus::default(),
        Some(status) => serde_json::from_value::<HistoryStatus>(status.clone())
            .map_err(|e| ComfyError::malformed(format!("{}.status", location), e.to_string()))?,
    };

    Ok(HistoryEntry {
        prompt,
        outputs,
        status,
    })
}

/// Decode a `/history` or `/history/{id}` response.
pub fn decode_history(value: &Value) -> Result<History> {
    let obj: &Map<String, Value> = value.as_object().ok_or_else(|| {
        ComfyError::malformed("history", format!("expected an object, got {}", type_name(value)))
    })?;
    obj.iter()
        .map(|(id, entry)| Ok((id.clone(), decode_history_entry(id, entry)?)))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
