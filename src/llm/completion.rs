//! Grammar-constrained completion client (llama.cpp `/completion`)
//!
//! The server streams one small JSON envelope per line:
//!
//! ```text
//! data: {"content": "{\"expl", "stop": false}
//! data: {"content": "", "stop": true, "tokens_evaluated": 812, "tokens_predicted": 57}
//! ```

use futures_util::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::sse::payloads;
use super::{LlmError, Usage};

/// One streamed completion envelope
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub tokens_evaluated: Option<u64>,
    #[serde(default)]
    pub tokens_predicted: Option<u64>,
}

impl CompletionChunk {
    /// Token counts, present on the final envelope
    pub fn usage(&self) -> Option<Usage> {
        match (self.tokens_evaluated, self.tokens_predicted) {
            (None, None) => None,
            (input, output) => Some(Usage {
                input_tokens: input.unwrap_or(0),
                output_tokens: output.unwrap_or(0),
            }),
        }
    }
}

/// Parse one envelope payload (already stripped of any `data:` prefix)
pub fn parse_chunk(payload: &str) -> Result<CompletionChunk, LlmError> {
    Ok(serde_json::from_str(payload)?)
}

/// Client for a llama.cpp-style completion server
#[derive(Clone)]
pub struct CompletionClient {
    base_url: String,
    client: reqwest::Client,
}

impl CompletionClient {
    /// Create a new completion client
    ///
    /// # Arguments
    /// * `base_url` - Server root (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Stream a completion constrained by a GBNF grammar
    ///
    /// # Arguments
    /// * `prompt` - Fully rendered prompt text
    /// * `grammar` - GBNF grammar the output must match
    /// * `n_predict` - Upper bound on generated tokens
    pub async fn complete_stream(
        &self,
        prompt: &str,
        grammar: &str,
        n_predict: u32,
    ) -> Result<BoxStream<'static, Result<CompletionChunk, LlmError>>, LlmError> {
        let endpoint = format!("{}/completion", self.base_url);
        let body = serde_json::json!({
            "prompt": prompt,
            "grammar": grammar,
            "n_predict": n_predict,
            "stream": true,
            "temperature": 0.0,
            "cache_prompt": true,
        });
        debug!(endpoint = %endpoint, prompt_chars = prompt.len(), "Starting completion stream");

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = payloads(response.bytes_stream()).map(|payload| payload.and_then(|p| parse_chunk(&p)));
        Ok(stream.boxed())
    }
}
