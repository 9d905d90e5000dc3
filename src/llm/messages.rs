//! Chat messages and tool definitions
//!
//! The conversation history is a list of [`ChatMessage`]s in the
//! OpenAI chat-completions shape. Grammar and mock backends only use the
//! `role`/`content` pair; the function-calling backend also records the
//! tool calls the model made and the tool results that answer them.

use serde::{Deserialize, Serialize};

/// Tokens charged per message on top of its text
const TOKENS_PER_MESSAGE: u64 = 4;
/// Rough characters per token for English text and code
const CHARS_PER_TOKEN: u64 = 4;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    /// An assistant turn that only calls tools
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role("assistant", content)
        }
    }

    /// The result of the tool call `call_id`
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role("tool", content)
        }
    }
}

/// A tool call made by the model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

/// Function call details; `arguments` is JSON text as the model wrote it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Merge one streamed tool-call fragment into the calls seen so far
///
/// Fragments carry the call's `index`; the id and name arrive once, the
/// arguments text arrives in pieces that are appended.
pub fn merge_tool_call(
    calls: &mut Vec<ToolCall>,
    index: usize,
    id: Option<&str>,
    name: Option<&str>,
    arguments: Option<&str>,
) {
    if calls.len() <= index {
        calls.resize_with(index + 1, || ToolCall {
            call_type: function_type(),
            ..ToolCall::default()
        });
    }
    let call = &mut calls[index];
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        call.id = id.to_string();
    }
    if let Some(name) = name.filter(|name| !name.is_empty()) {
        call.function.name.push_str(name);
    }
    if let Some(arguments) = arguments {
        call.function.arguments.push_str(arguments);
    }
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

impl Tool {
    fn function(name: &str, description: &str, parameters: serde_json::Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    /// Run code in the kernel and see its output
    pub fn execute_code() -> Self {
        Self::function(
            "execute_code",
            "Execute code in the persistent kernel. Variables and imports survive between calls. Use this to compute, inspect files, or produce plots; the output is returned to you.",
            code_parameters(),
        )
    }

    /// Show code to the user without running it
    pub fn show_sample_code() -> Self {
        Self::function(
            "show_sample_code",
            "Show example code to the user without executing it. Use this when the user asks how to do something rather than asking you to do it.",
            code_parameters(),
        )
    }
}

fn code_parameters() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "explanation": {
                "type": "string",
                "description": "What the code does, in one or two sentences"
            },
            "language": {
                "type": "string",
                "enum": ["python", "bash"],
                "description": "The programming language of the code"
            },
            "code": {
                "type": "string",
                "description": "The code"
            },
            "saved_filenames": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Files the code writes into the working directory"
            }
        },
        "required": ["explanation", "code"]
    })
}

/// Character-based token estimate for one text
pub fn estimate_text_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// Token estimate for a whole conversation
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|m| {
            let calls: u64 = m
                .tool_calls
                .iter()
                .flatten()
                .map(|c| estimate_text_tokens(&c.function.name) + estimate_text_tokens(&c.function.arguments))
                .sum();
            TOKENS_PER_MESSAGE + estimate_text_tokens(&m.content) + calls
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_tool_call_fragments() {
        let mut calls = Vec::new();
        merge_tool_call(&mut calls, 0, Some("call_1"), Some("execute_code"), Some(""));
        merge_tool_call(&mut calls, 0, None, None, Some("{\"code\": "));
        merge_tool_call(&mut calls, 0, None, None, Some("\"print(1)\"}"));
        merge_tool_call(&mut calls, 1, Some("call_2"), Some("show_sample_code"), Some("{}"));

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].call_type, "function");
        assert_eq!(calls[0].function.name, "execute_code");
        assert_eq!(calls[0].function.arguments, "{\"code\": \"print(1)\"}");
        assert_eq!(calls[1].function.name, "show_sample_code");
    }

    #[test]
    fn test_tool_message_serialization() {
        let msg = ChatMessage::tool("call_1", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);

        let history = vec![ChatMessage::system("abcd"), ChatMessage::user("hi")];
        assert_eq!(estimate_tokens(&history), 4 + 1 + 4 + 1);
    }

    #[test]
    fn test_tool_definitions() {
        let tool = serde_json::to_value(Tool::execute_code()).unwrap();
        assert_eq!(tool["type"], "function");
        assert_eq!(tool["function"]["name"], "execute_code");
        assert_eq!(tool["function"]["parameters"]["required"][1], "code");
    }
}
