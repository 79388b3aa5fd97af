use serde_json::Value;
use thiserror::Error;

use crate::messages::ExecutionErrorData;

/// Errors returned by ComfyUI operations.
#[derive(Error, Debug)]
pub enum ComfyError {
    /// ComfyUI returned a non-success HTTP status.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    /// The event-stream connection could not be established or failed mid-read.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file access failed (workflow files, image upload/save).
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// The response from ComfyUI was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    /// A positional tuple record did not match the expected shape.
    #[error("Malformed record at {location}: {reason}")]
    MalformedRecord { location: String, reason: String },

    /// An event of a known kind carried a payload of the wrong shape.
    #[error("Malformed '{kind}' event: {reason}")]
    MalformedEvent { kind: String, reason: String },

    /// A typed accessor was called on an event of a different kind.
    #[error("Expected a '{expected}' event, got '{actual}'")]
    WrongKind {
        expected: &'static str,
        actual: String,
    },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Input '{input}' not found on node {node_id}")]
    InputNotFound { node_id: String, input: String },

    /// Validation: the workflow has no nodes.
    #[error("Workflow is empty")]
    EmptyGraph,

    /// Validation: a node has an empty `class_type`.
    #[error("Node {0} has no class_type")]
    MissingNodeType(String),

    /// The server accepted the request but reported node-level errors.
    #[error("Workflow rejected by ComfyUI: {node_errors}")]
    RemoteRejection { node_errors: Value },

    /// A node raised an exception while the prompt was running.
    #[error("Execution failed in node {} ({}): {}: {}", .0.node_id, .0.node_type, .0.exception_type, .0.exception_message)]
    Execution(Box<ExecutionErrorData>),

    /// The event stream ended while a caller was still waiting on it.
    #[error("Event stream closed: {0}")]
    StreamClosed(String),

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// Timed out waiting for generation to complete.
    #[error("Generation timed out")]
    Timeout,
}

impl ComfyError {
    /// Whether retrying the same call without changes could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComfyError::Network { .. }
            | ComfyError::WebSocket(_)
            | ComfyError::StreamClosed(_)
            | ComfyError::Timeout => true,
            ComfyError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn malformed(location: impl Into<String>, reason: impl Into<String>) -> Self {
        ComfyError::MalformedRecord {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ComfyError>;
