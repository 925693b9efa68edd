//! Kernel wire protocol
//!
//! Kernels speak line-delimited JSON over stdio. The host writes one
//! [`Submission`] per line on the kernel's stdin; the kernel answers with a
//! stream of envelopes on stdout:
//!
//! ```text
//! {"parent_id": "<msg_id>", "msg_type": "stream", "content": {"name": "stdout", "text": "3\n"}}
//! {"parent_id": "<msg_id>", "msg_type": "status", "content": {"execution_state": "idle"}}
//! ```
//!
//! Message types and content fields follow the Jupyter iopub vocabulary so
//! that an adapter in front of a real Jupyter kernel stays a thin shim.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MIME type carrying the plain-text rendering of a result
pub const TEXT_PLAIN: &str = "text/plain";

/// Code submitted to a kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Id echoed back as `parent_id` on every message the submission causes
    pub msg_id: String,
    pub code: String,
}

impl Submission {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::now_v7().to_string(),
            code: code.into(),
        }
    }

    /// Encode as a single protocol line (no trailing newline)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Run state reported by `status` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// A MIME bundle as carried by `execute_result` and `display_data`
pub type MimeBundle = HashMap<String, serde_json::Value>;

/// Typed message received from a kernel
#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    /// Text written to stdout/stderr
    Stream { name: String, text: String },
    /// Value of the final expression of a fragment
    ExecuteResult { data: MimeBundle },
    /// Rich display output (plots, tables)
    DisplayData { data: MimeBundle },
    /// Uncaught exception
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Status(ExecutionState),
}

impl KernelMessage {
    /// Textual contribution of this message to the accumulated output.
    ///
    /// Data bundles contribute their `text/plain` rendering only; a bundle
    /// without one (e.g. an image-only display) contributes nothing.
    pub fn output_text(&self) -> Option<String> {
        match self {
            KernelMessage::Stream { text, .. } => Some(text.clone()),
            KernelMessage::ExecuteResult { data } | KernelMessage::DisplayData { data } => {
                data.get(TEXT_PLAIN).map(plain_text)
            }
            _ => None,
        }
    }

    /// Diagnostic text for an error message
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            KernelMessage::Error {
                ename,
                evalue,
                traceback,
            } => {
                if traceback.is_empty() {
                    Some(format!("{}: {}", ename, evalue))
                } else {
                    Some(traceback.join("\n"))
                }
            }
            _ => None,
        }
    }
}

/// `text/plain` may arrive as a string or as a list of lines
fn plain_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(lines) => lines
            .iter()
            .filter_map(|l| l.as_str())
            .collect::<Vec<_>>()
            .concat(),
        other => other.to_string(),
    }
}

/// A kernel message together with the submission it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// `None` for messages not caused by a submission (startup status)
    pub parent_id: Option<String>,
    pub message: KernelMessage,
}

/// Error decoding a protocol line
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed kernel message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("kernel message '{msg_type}' is missing field '{field}'")]
    MissingField {
        msg_type: String,
        field: &'static str,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    parent_id: Option<String>,
    msg_type: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct StreamContent {
    #[serde(default = "default_stream_name")]
    name: String,
    text: String,
}

fn default_stream_name() -> String {
    "stdout".to_string()
}

#[derive(Deserialize)]
struct DataContent {
    #[serde(default)]
    data: MimeBundle,
}

#[derive(Deserialize)]
struct ErrorContent {
    #[serde(default)]
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: ExecutionState,
}

/// Decode one line of kernel output.
///
/// Returns `Ok(None)` for message types the orchestrator does not act on
/// (e.g. `execute_input`, `clear_output`).
pub fn decode_line(line: &str) -> Result<Option<Envelope>, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(line)?;

    let message = match raw.msg_type.as_str() {
        "stream" => {
            let c: StreamContent = serde_json::from_value(raw.content)?;
            KernelMessage::Stream {
                name: c.name,
                text: c.text,
            }
        }
        "execute_result" => {
            let c: DataContent = serde_json::from_value(raw.content)?;
            KernelMessage::ExecuteResult { data: c.data }
        }
        "display_data" => {
            let c: DataContent = serde_json::from_value(raw.content)?;
            KernelMessage::DisplayData { data: c.data }
        }
        "error" => {
            let c: ErrorContent = serde_json::from_value(raw.content)?;
            KernelMessage::Error {
                ename: c.ename,
                evalue: c.evalue,
                traceback: c.traceback,
            }
        }
        "status" => {
            if raw.content.get("execution_state").is_none() {
                return Err(ProtocolError::MissingField {
                    msg_type: raw.msg_type,
                    field: "execution_state",
                });
            }
            let c: StatusContent = serde_json::from_value(raw.content)?;
            KernelMessage::Status(c.execution_state)
        }
        _ => return Ok(None),
    };

    Ok(Some(Envelope {
        parent_id: raw.parent_id,
        message,
    }))
}
