//! Kernel channel message envelope and typed contents.
//!
//! Every message carries a `header` with a `msg_type` and a correlation
//! `msg_id`; replies reference the originating request through
//! `parent_header.msg_id`. Authentication is connection-time only (bearer
//! header on the WebSocket upgrade), never in-band.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Message types recognized on the kernel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// Submit code for execution.
    ExecuteRequest,
    /// Terminal reply for an execute exchange (`content.status: ok|error`).
    ExecuteReply,
    /// Returned value of an execution (`content.data["text/plain"]`).
    ExecuteResult,
    /// Incremental stdout/stderr chunk.
    Stream,
    /// Kernel execution-state report.
    Status,
    /// Liveness probe.
    KernelInfoRequest,
    /// Liveness probe answer.
    KernelInfoReply,
    /// Forward-compatible catch-all for unrecognized message types.
    #[serde(other)]
    Unknown,
}

/// Message header carrying the correlation id and type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: MsgType,
}

/// A single frame on the kernel channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub content: Value,
}

impl WireMessage {
    /// Correlation id of the exchange this frame belongs to.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Deserialize `content` into a typed shape.
    pub fn typed_content<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.content.clone())
    }

    pub fn execute_request(msg_id: &str, code: &str) -> Self {
        Self {
            header: Header {
                msg_id: msg_id.to_string(),
                msg_type: MsgType::ExecuteRequest,
            },
            parent_header: None,
            content: json!({ "code": code }),
        }
    }

    pub fn kernel_info_request(msg_id: &str) -> Self {
        Self {
            header: Header {
                msg_id: msg_id.to_string(),
                msg_type: MsgType::KernelInfoRequest,
            },
            parent_header: None,
            content: Value::Null,
        }
    }

    pub fn kernel_info_reply(parent_id: &str) -> Self {
        Self::reply(
            MsgType::KernelInfoReply,
            parent_id,
            json!({ "status": "ok" }),
        )
    }

    pub fn stream(parent_id: &str, name: StreamName, text: &str) -> Self {
        Self::reply(
            MsgType::Stream,
            parent_id,
            json!({ "name": name, "text": text }),
        )
    }

    pub fn execute_result(parent_id: &str, text_plain: &str) -> Self {
        Self::reply(
            MsgType::ExecuteResult,
            parent_id,
            json!({ "data": { "text/plain": text_plain } }),
        )
    }

    pub fn status(parent_id: &str, state: ExecutionState) -> Self {
        Self::reply(
            MsgType::Status,
            parent_id,
            json!({ "execution_state": state }),
        )
    }

    pub fn execute_reply_ok(parent_id: &str) -> Self {
        Self::reply(MsgType::ExecuteReply, parent_id, json!({ "status": "ok" }))
    }

    pub fn execute_reply_error(parent_id: &str, ename: &str, evalue: &str) -> Self {
        Self::reply(
            MsgType::ExecuteReply,
            parent_id,
            json!({ "status": "error", "ename": ename, "evalue": evalue, "traceback": [] }),
        )
    }

    fn reply(msg_type: MsgType, parent_id: &str, content: Value) -> Self {
        Self {
            header: Header {
                msg_id: format!("{parent_id}.reply"),
                msg_type,
            },
            parent_header: Some(Header {
                msg_id: parent_id.to_string(),
                msg_type,
            }),
            content,
        }
    }
}

/// Output stream a `stream` frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// Kernel-reported execution state carried by `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Idle,
    Busy,
    Dead,
}

/// Status tag on a terminal `execute_reply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// `content` of an `execute_request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequestContent {
    pub code: String,
}

/// `content` of a `stream` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    pub text: String,
}

/// `content` of an `execute_result` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResultContent {
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl ExecuteResultContent {
    /// Plain-text rendering of the returned value, when present.
    pub fn text_plain(&self) -> Option<String> {
        self.data
            .get("text/plain")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// `content` of a terminal `execute_reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReplyContent {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
}

/// `content` of a `status` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}
