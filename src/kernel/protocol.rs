//! Kernel wire messages
//!
//! The kernel speaks Jupyter-shaped messages, one JSON object per line over
//! its stdio: a `header` naming the message, a `parent_header` pointing at the
//! request it answers, and a free-form `content`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
}

/// Reference to the request a message belongs to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParentHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
}

/// A native kernel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    #[serde(default)]
    pub header: Header,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl KernelMessage {
    /// Build a request with a fresh message id
    pub fn request(msg_type: &str, content: serde_json::Value) -> Self {
        Self {
            header: Header {
                msg_id: Uuid::now_v7().to_string(),
                msg_type: msg_type.to_string(),
            },
            parent_header: ParentHeader::default(),
            msg_type: msg_type.to_string(),
            content,
        }
    }

    pub fn execute_request(code: &str, language: &str) -> Self {
        Self::request(
            "execute_request",
            serde_json::json!({
                "code": code,
                "language": language,
                "silent": false,
            }),
        )
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// The id of the request this message answers
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.msg_id.as_deref()
    }

    /// True for `status` messages reporting `idle`
    pub fn is_idle(&self) -> bool {
        self.msg_type == "status" && self.content["execution_state"] == "idle"
    }
}

/// Contents of the connection file a kernel writes once it is listening
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub kernel_name: String,
    pub pid: u32,
    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub protocol_version: String,
}
