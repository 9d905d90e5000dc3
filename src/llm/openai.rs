//! OpenAI-compatible chat-completions client with streamed tool calls

use futures_util::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::messages::{ChatMessage, Tool};
use super::sse::payloads;
use super::{LlmError, Usage};

/// One parsed stream chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub usage: Option<Usage>,
}

/// Fragment of one tool call, identified by its index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChoiceBody>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct ChoiceBody {
    #[serde(default)]
    delta: DeltaBody,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallBody>,
}

#[derive(Debug, Deserialize)]
struct ToolCallBody {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionBody>,
}

#[derive(Debug, Deserialize)]
struct FunctionBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Parse one SSE payload; `[DONE]` yields `None`
pub fn parse_chunk(payload: &str) -> Result<Option<ChatDelta>, LlmError> {
    if payload.trim() == "[DONE]" {
        return Ok(None);
    }
    let body: ChunkBody = serde_json::from_str(payload)?;
    let mut delta = ChatDelta {
        usage: body.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        ..ChatDelta::default()
    };
    if let Some(choice) = body.choices.into_iter().next() {
        delta.content = choice.delta.content.filter(|c| !c.is_empty());
        delta.tool_calls = choice
            .delta
            .tool_calls
            .into_iter()
            .map(|call| {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                }
            })
            .collect();
    }
    Ok(Some(delta))
}

/// Client for `/chat/completions`
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - API root including the version (e.g., "https://api.openai.com/v1")
    /// * `api_key` - Bearer key, if the endpoint needs one
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Start a streamed chat completion
    ///
    /// # Arguments
    /// * `model` - Model name
    /// * `messages` - The conversation history
    /// * `tools` - Tools the model may call
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<BoxStream<'static, Result<ChatDelta, LlmError>>, LlmError> {
        let endpoint = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
            "temperature": 0.0,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        debug!(endpoint = %endpoint, model = model, messages = messages.len(), "Starting chat stream");

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = payloads(response.bytes_stream()).filter_map(|payload| async move {
            match payload {
                Ok(payload) => parse_chunk(&payload).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_delta() {
        let delta = parse_chunk(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hel"));
        assert!(delta.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_call_delta() {
        let delta = parse_chunk(
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_9","type":"function","function":{"name":"execute_code","arguments":"{\"co"}}]}}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            delta.tool_calls,
            vec![ToolCallDelta {
                index: 0,
                id: Some("call_9".to_string()),
                name: Some("execute_code".to_string()),
                arguments: Some("{\"co".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_usage_and_done() {
        let delta = parse_chunk(r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":33,"total_tokens":153}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            delta.usage,
            Some(Usage {
                input_tokens: 120,
                output_tokens: 33
            })
        );
        assert_eq!(parse_chunk("[DONE]").unwrap(), None);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_chunk("{not json"), Err(LlmError::Decode(_))));
    }
}
