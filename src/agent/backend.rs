//! Model backends and the actions parsed from their responses
//!
//! The engine is written once against [`ModelBackend`]: stream a response as
//! [`ResponseDelta`]s, then parse the assembled [`ModelResponse`] into an
//! [`Action`]. Backends differ only in how they talk to the model and in
//! the shape of what it answers.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;

use super::prompt::JSON_SYSTEM_PROMPT;
use crate::llm::messages::merge_tool_call;
use crate::llm::{ChatMessage, LlmError, ToolCall, Usage};

/// What the model decided to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run code in the kernel
    Execute {
        language: String,
        code: String,
        explanation: String,
        saved_filenames: Vec<String>,
    },
    /// Answer the user; ends the run
    DirectMessage { text: String },
    /// Show code without running it; ends the run
    ShowSampleCode {
        language: String,
        code: String,
        explanation: String,
    },
    /// Nothing to do; ends the run with the explanation
    NoAction { explanation: String },
}

/// Error type for turning a model response into an [`Action`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("model returned an empty response")]
    Empty,
    #[error("model response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("model response is malformed at offset {offset} (scanner state {state})")]
    Malformed { offset: usize, state: String },
    #[error("model called unknown tool: {0}")]
    UnknownTool(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("model response is missing {0}")]
    MissingField(&'static str),
}

/// Error type for obtaining a model response
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("model provider error: {0}")]
    Llm(#[from] LlmError),
    #[error("no fixture for prompt: {0}")]
    NoFixture(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

/// One increment of a streamed model response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseDelta {
    /// Plain assistant text, shown to the user as it arrives
    Text(String),
    /// Structured JSON body text (grammar and fixture responses)
    Json(String),
    /// Fragment of a function call
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    },
    /// Provider-reported token counts
    Usage(Usage),
}

/// A model response assembled from its deltas
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub json: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn apply(&mut self, delta: &ResponseDelta) {
        match delta {
            ResponseDelta::Text(text) => self.text.push_str(text),
            ResponseDelta::Json(text) => self.json.push_str(text),
            ResponseDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => merge_tool_call(
                &mut self.tool_calls,
                *index,
                id.as_deref(),
                name.as_deref(),
                arguments.as_deref(),
            ),
            ResponseDelta::Usage(usage) => self.usage = Some(*usage),
        }
    }

    /// Everything the model wrote, for output accounting
    pub fn written_text(&self) -> String {
        let mut out = String::with_capacity(self.text.len() + self.json.len());
        out.push_str(&self.text);
        out.push_str(&self.json);
        for call in &self.tool_calls {
            out.push_str(&call.function.name);
            out.push_str(&call.function.arguments);
        }
        out
    }
}

pub type DeltaStream = BoxStream<'static, Result<ResponseDelta, BackendError>>;

/// A source of model responses
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend kind, for logs and metrics
    fn name(&self) -> &'static str;

    /// Model identifier reported in the run context
    fn model(&self) -> &str;

    /// Whether responses should drive typing events
    fn typing_events(&self) -> bool {
        true
    }

    /// System prompt used when the configuration sets none
    fn default_system_prompt(&self) -> &'static str {
        JSON_SYSTEM_PROMPT
    }

    /// Start streaming a response to the conversation so far
    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError>;

    /// Parse a complete response
    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError>;

    /// Append an executed action and its observation to the history
    fn record_execution(
        &self,
        history: &mut Vec<ChatMessage>,
        response: &ModelResponse,
        observation: &str,
        follow_up: &str,
    ) {
        let said = if response.json.is_empty() {
            response.text.clone()
        } else {
            response.json.clone()
        };
        history.push(ChatMessage::assistant(said));
        history.push(ChatMessage::user(format!("{}\n\n{}", observation, follow_up)));
    }
}

/// The JSON object grammar and fixture responses carry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionFields {
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "action_input")]
    pub code: Option<String>,
    #[serde(default)]
    pub saved_filenames: Vec<String>,
}

impl ActionFields {
    /// Decide the action these fields describe
    ///
    /// Without an explicit `action`, code means execute and no code means
    /// the explanation is the answer.
    pub fn into_action(self) -> Result<Action, ParseError> {
        let explanation = self.explanation.unwrap_or_default();
        let language = self
            .language
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "python".to_string());
        let code = self.code.filter(|c| !c.trim().is_empty());

        match self.action.as_deref() {
            None | Some("execute_code") | Some("execute_python_code") | Some("execute_bash_code") => {
                let language = match self.action.as_deref() {
                    Some("execute_bash_code") => "bash".to_string(),
                    _ => language,
                };
                match code {
                    Some(code) => Ok(Action::Execute {
                        language,
                        code,
                        explanation,
                        saved_filenames: self.saved_filenames,
                    }),
                    None if self.action.is_none() && !explanation.is_empty() => {
                        Ok(Action::DirectMessage { text: explanation })
                    }
                    None => Err(ParseError::MissingField("code")),
                }
            }
            Some("show_sample_code") => Ok(Action::ShowSampleCode {
                language,
                code: code.ok_or(ParseError::MissingField("code"))?,
                explanation,
            }),
            Some("final_answer") | Some("direct_message") => {
                if explanation.is_empty() {
                    return Err(ParseError::MissingField("explanation"));
                }
                Ok(Action::DirectMessage { text: explanation })
            }
            Some("no_action") => Ok(Action::NoAction { explanation }),
            Some(other) => Err(ParseError::UnknownAction(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(json: &str) -> ActionFields {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_code_means_execute() {
        let action = fields(r#"{"code": "print('hello world')", "explanation": "prints"}"#)
            .into_action()
            .unwrap();
        assert_eq!(
            action,
            Action::Execute {
                language: "python".to_string(),
                code: "print('hello world')".to_string(),
                explanation: "prints".to_string(),
                saved_filenames: vec![],
            }
        );
    }

    #[test]
    fn test_explanation_only_is_answer() {
        let action = fields(r#"{"explanation": "this code prints 'hello world'"}"#)
            .into_action()
            .unwrap();
        assert_eq!(
            action,
            Action::DirectMessage {
                text: "this code prints 'hello world'".to_string()
            }
        );
    }

    #[test]
    fn test_explicit_actions() {
        let sample = fields(r#"{"action": "show_sample_code", "code": "ls", "language": "bash"}"#)
            .into_action()
            .unwrap();
        assert!(matches!(sample, Action::ShowSampleCode { ref language, .. } if language == "bash"));

        let bash = fields(r#"{"action": "execute_bash_code", "action_input": "ls -la"}"#)
            .into_action()
            .unwrap();
        assert!(matches!(bash, Action::Execute { ref language, ref code, .. } if language == "bash" && code == "ls -la"));

        assert_eq!(
            fields(r#"{"action": "launch_rockets"}"#).into_action(),
            Err(ParseError::UnknownAction("launch_rockets".to_string()))
        );
        assert_eq!(
            fields(r#"{"action": "execute_code", "explanation": "x"}"#).into_action(),
            Err(ParseError::MissingField("code"))
        );
    }

    #[test]
    fn test_response_assembly() {
        let mut response = ModelResponse::default();
        response.apply(&ResponseDelta::Json("{\"code\":".to_string()));
        response.apply(&ResponseDelta::Json(" \"1\"}".to_string()));
        response.apply(&ResponseDelta::ToolCall {
            index: 0,
            id: Some("c1".to_string()),
            name: Some("execute_code".to_string()),
            arguments: Some("{}".to_string()),
        });
        response.apply(&ResponseDelta::Usage(Usage {
            input_tokens: 3,
            output_tokens: 4,
        }));
        assert_eq!(response.json, "{\"code\": \"1\"}");
        assert_eq!(response.tool_calls[0].id, "c1");
        assert_eq!(response.usage.map(|u| u.output_tokens), Some(4));
        assert!(response.written_text().contains("execute_code"));
    }
}
