//! Grammar-constrained backend (llama.cpp-style completion server)
//!
//! The conversation is rendered into a ChatML prompt and the completion is
//! constrained by a GBNF grammar to a single JSON action object. The
//! finished text goes through the token scanner before it is decoded, so a
//! truncated or broken object is reported with the point where it broke.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::backend::{
    Action, ActionFields, BackendError, DeltaStream, ModelBackend, ModelResponse, ParseError,
    ResponseDelta,
};
use crate::llm::{ChatMessage, CompletionClient};
use crate::scanner::scan_complete;

/// GBNF grammar for one action object
pub const ACTION_GRAMMAR: &str = r#"root ::= final | execute
final ::= "{" ws "\"explanation\"" ws ":" ws string ws "," ws "\"action\"" ws ":" ws "\"final_answer\"" ws "}"
execute ::= "{" ws "\"explanation\"" ws ":" ws string ws "," ws "\"action\"" ws ":" ws act ws "," ws "\"language\"" ws ":" ws lang ws "," ws "\"code\"" ws ":" ws string ws "," ws "\"saved_filenames\"" ws ":" ws strings ws "}"
act ::= "\"execute_code\"" | "\"show_sample_code\""
lang ::= "\"python\"" | "\"bash\""
strings ::= "[" ws ( string ( ws "," ws string )* )? ws "]"
string ::= "\"" ( [^"\\] | "\\" ( ["\\/bfnrt] | "u" hex hex hex hex ) )* "\""
hex ::= [0-9a-fA-F]
ws ::= [ \t\n]*
"#;

pub struct GrammarBackend {
    client: CompletionClient,
    model: String,
    max_tokens: u32,
}

impl GrammarBackend {
    /// Create a new grammar backend
    ///
    /// # Arguments
    /// * `client` - Completion server client
    /// * `model` - Model label for the run context (the server decides the model)
    /// * `max_tokens` - Upper bound on tokens per completion
    pub fn new(client: CompletionClient, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens,
        }
    }
}

/// Render a conversation as a ChatML prompt ending in an open assistant turn
pub fn render_prompt(history: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in history {
        // Tool results are shown to the model as user turns
        let role = if message.role == "tool" { "user" } else { message.role.as_str() };
        prompt.push_str("<|im_start|>");
        prompt.push_str(role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// Decode a finished action object
pub fn parse_action_text(text: &str) -> Result<Action, ParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(halt) = scan_complete(text).halt {
        return Err(ParseError::Malformed {
            offset: halt.offset,
            state: format!("{:?}", halt.state),
        });
    }
    let fields: ActionFields =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    fields.into_action()
}

#[async_trait]
impl ModelBackend for GrammarBackend {
    fn name(&self) -> &'static str {
        "grammar"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        let prompt = render_prompt(history);
        let chunks = self
            .client
            .complete_stream(&prompt, ACTION_GRAMMAR, self.max_tokens)
            .await?;
        let stream = chunks.flat_map(|chunk| {
            let items: Vec<Result<ResponseDelta, BackendError>> = match chunk {
                Ok(chunk) => {
                    let mut items = Vec::new();
                    if !chunk.content.is_empty() {
                        items.push(Ok(ResponseDelta::Json(chunk.content.clone())));
                    }
                    if let Some(usage) = chunk.usage() {
                        items.push(Ok(ResponseDelta::Usage(usage)));
                    }
                    items
                }
                Err(e) => vec![Err(BackendError::from(e))],
            };
            stream::iter(items)
        });
        Ok(stream.boxed())
    }

    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError> {
        parse_action_text(&response.json)
    }
}
