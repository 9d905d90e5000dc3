//! Function-calling backend (OpenAI-compatible chat completions)
//!
//! The model either answers in plain text (the final answer) or calls one of
//! two tools, `execute_code` and `show_sample_code`, whose JSON arguments
//! stream in fragments merged by call index.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::backend::{
    Action, ActionFields, BackendError, DeltaStream, ModelBackend, ModelResponse, ParseError,
    ResponseDelta,
};
use super::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::llm::{ChatDelta, ChatMessage, OpenAiClient, Tool};
use crate::scanner::ArgumentExtractor;

pub struct FunctionCallingBackend {
    client: OpenAiClient,
    model: String,
    tools: Vec<Tool>,
}

impl FunctionCallingBackend {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            tools: vec![Tool::execute_code(), Tool::show_sample_code()],
        }
    }
}

/// Split one provider chunk into response deltas
fn deltas(chunk: ChatDelta) -> Vec<ResponseDelta> {
    let mut out = Vec::new();
    if let Some(content) = chunk.content {
        out.push(ResponseDelta::Text(content));
    }
    for call in chunk.tool_calls {
        out.push(ResponseDelta::ToolCall {
            index: call.index,
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        });
    }
    if let Some(usage) = chunk.usage {
        out.push(ResponseDelta::Usage(usage));
    }
    out
}

/// Arguments of a tool call, tolerating JSON the model got slightly wrong
fn parse_arguments(arguments: &str) -> Result<ActionFields, ParseError> {
    match serde_json::from_str::<ActionFields>(arguments) {
        Ok(fields) => Ok(fields),
        Err(e) => {
            // Unescaped quotes or a truncated tail still leave the scanner
            // with the leading string values
            let mut extractor = ArgumentExtractor::new();
            let found = extractor.feed(arguments);
            match found.code {
                Some(code) if !code.trim().is_empty() => Ok(ActionFields {
                    explanation: found.explanation,
                    code: Some(code),
                    ..ActionFields::default()
                }),
                _ => Err(ParseError::InvalidJson(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl ModelBackend for FunctionCallingBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn default_system_prompt(&self) -> &'static str {
        DEFAULT_SYSTEM_PROMPT
    }

    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        let chunks = self.client.chat_stream(&self.model, history, &self.tools).await?;
        let stream = chunks.flat_map(|chunk| {
            let items: Vec<Result<ResponseDelta, BackendError>> = match chunk {
                Ok(chunk) => deltas(chunk).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(BackendError::from(e))],
            };
            stream::iter(items)
        });
        Ok(stream.boxed())
    }

    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError> {
        let Some(call) = response.tool_calls.first() else {
            let text = response.text.trim();
            if text.is_empty() {
                return Err(ParseError::Empty);
            }
            return Ok(Action::DirectMessage {
                text: text.to_string(),
            });
        };

        let mut fields = parse_arguments(&call.function.arguments)?;
        match call.function.name.as_str() {
            "execute_code" | "show_sample_code" => {
                fields.action = Some(call.function.name.clone());
                fields.into_action()
            }
            other => Err(ParseError::UnknownTool(other.to_string())),
        }
    }

    fn record_execution(
        &self,
        history: &mut Vec<ChatMessage>,
        response: &ModelResponse,
        observation: &str,
        follow_up: &str,
    ) {
        // Only the first call ran; the provider wants a reply for every call
        // id in the assistant turn, so the turn keeps just that one.
        let Some(call) = response.tool_calls.first() else {
            history.push(ChatMessage::assistant(response.text.clone()));
            history.push(ChatMessage::user(format!("{}\n\n{}", observation, follow_up)));
            return;
        };
        history.push(ChatMessage::assistant_tool_calls(
            response.text.clone(),
            vec![call.clone()],
        ));
        history.push(ChatMessage::tool(call.id.clone(), observation));
        history.push(ChatMessage::user(follow_up));
    }
}
