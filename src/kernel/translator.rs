//! Kernel message translation
//!
//! Maps one native kernel message to at most one [`ExecuteResponse`]:
//!
//! ```text
//! stream         ──► Stdout / Stderr (by channel name)
//! execute_result ──► Result (mime → payload, images written to the workspace)
//! display_data   ──► Result
//! error          ──► Traceback (ANSI-free, long ones cut to head + tail)
//! anything else  ──► dropped
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::protocol::KernelMessage;
use crate::output::strip_ansi;
use crate::workspace::{Workspace, WorkspaceError};

/// Tracebacks longer than this many lines are cut
const TRACEBACK_MAX_LINES: usize = 6;
/// Lines kept from each end of a long traceback
const TRACEBACK_KEEP_LINES: usize = 3;

/// Normalized kernel output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExecuteResponse {
    Stdout(String),
    Stderr(String),
    /// MIME type → payload; images carry a workspace file name
    Result(BTreeMap<String, String>),
    Traceback(String),
}

/// Error type for message translation
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("invalid base64 payload for {mime}: {source}")]
    InvalidImage {
        mime: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("failed to store output: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Translate one kernel message
pub fn translate(
    message: &KernelMessage,
    workspace: &Workspace,
) -> Result<Option<ExecuteResponse>, TranslateError> {
    let content = &message.content;
    match message.msg_type.as_str() {
        "stream" => {
            let text = content["text"].as_str().unwrap_or_default().to_string();
            Ok(match content["name"].as_str() {
                Some("stdout") => Some(ExecuteResponse::Stdout(text)),
                Some("stderr") => Some(ExecuteResponse::Stderr(text)),
                _ => None,
            })
        }
        "execute_result" | "display_data" => {
            let Some(data) = content["data"].as_object() else {
                return Ok(None);
            };
            let mut result = BTreeMap::new();
            for (mime, payload) in data {
                let value = match mime.as_str() {
                    "image/png" => store_image(workspace, mime, payload, "png")?,
                    "image/gif" => store_image(workspace, mime, payload, "gif")?,
                    // Unknown types pass through untouched
                    _ => match payload {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                };
                result.insert(mime.clone(), value);
            }
            if result.is_empty() {
                return Ok(None);
            }
            Ok(Some(ExecuteResponse::Result(result)))
        }
        "error" => Ok(Some(ExecuteResponse::Traceback(traceback_text(content)))),
        other => {
            debug!(msg_type = other, "Dropping kernel message");
            Ok(None)
        }
    }
}

/// Whether translating `message` writes image files to the workspace
pub fn stores_files(message: &KernelMessage) -> bool {
    matches!(message.msg_type.as_str(), "execute_result" | "display_data")
        && message.content["data"]
            .as_object()
            .is_some_and(|data| data.contains_key("image/png") || data.contains_key("image/gif"))
}

fn store_image(
    workspace: &Workspace,
    mime: &str,
    payload: &serde_json::Value,
    extension: &str,
) -> Result<String, TranslateError> {
    let encoded: String = payload
        .as_str()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|source| TranslateError::InvalidImage {
            mime: mime.to_string(),
            source,
        })?;
    Ok(workspace.write_output(&bytes, extension)?)
}

fn traceback_text(content: &serde_json::Value) -> String {
    let joined = match content["traceback"].as_array() {
        Some(frames) if !frames.is_empty() => frames
            .iter()
            .map(|frame| frame.as_str().map(str::to_string).unwrap_or_else(|| frame.to_string()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => format!(
            "{}: {}",
            content["ename"].as_str().unwrap_or("Error"),
            content["evalue"].as_str().unwrap_or_default()
        ),
    };
    truncate_traceback(&strip_ansi(&joined))
}

/// Keep the first and last three lines of a traceback longer than six lines
pub fn truncate_traceback(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= TRACEBACK_MAX_LINES {
        return lines.join("\n");
    }
    let head = &lines[..TRACEBACK_KEEP_LINES];
    let tail = &lines[lines.len() - TRACEBACK_KEEP_LINES..];
    head.iter().chain(tail.iter()).copied().collect::<Vec<_>>().join("\n")
}
