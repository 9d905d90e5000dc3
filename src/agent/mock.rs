//! Deterministic backend replaying canned responses
//!
//! Fixtures map a prompt to the responses the model gives on successive
//! iterations of a run for that prompt. Which response comes next is read
//! off the history: the number of assistant turns since the prompt.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::backend::{
    Action, ActionFields, BackendError, DeltaStream, ModelBackend, ModelResponse, ParseError,
    ResponseDelta,
};
use crate::llm::ChatMessage;

pub struct MockBackend {
    fixtures: HashMap<String, Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            fixtures: HashMap::new(),
        }
    }

    /// Register the responses for one prompt
    pub fn with_fixture(mut self, prompt: impl Into<String>, responses: Vec<serde_json::Value>) -> Self {
        self.fixtures.insert(
            prompt.into(),
            responses.iter().map(|r| r.to_string()).collect(),
        );
        self
    }

    /// Load fixtures from a JSON object of `prompt -> [response, ...]`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BackendError::Fixture(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, BackendError> {
        let fixtures: HashMap<String, Vec<serde_json::Value>> =
            serde_json::from_str(text).map_err(|e| BackendError::Fixture(e.to_string()))?;
        Ok(fixtures
            .into_iter()
            .fold(Self::new(), |backend, (prompt, responses)| backend.with_fixture(prompt, responses)))
    }

    /// The built-in hello world script
    pub fn hello_world() -> Self {
        Self::new().with_fixture(
            "write a hello world in python",
            vec![
                serde_json::json!({
                    "explanation": "I will print hello world with Python's print function.",
                    "code": "print('hello world')",
                    "language": "python",
                }),
                serde_json::json!({
                    "explanation": "this code prints 'hello world'",
                }),
            ],
        )
    }

    /// The fixture response for the current point of the conversation
    fn next_response(&self, history: &[ChatMessage]) -> Result<String, BackendError> {
        let (position, prompt, responses) = history
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, m)| m.role == "user")
            .find_map(|(i, m)| self.fixtures.get(&m.content).map(|r| (i, &m.content, r)))
            .ok_or_else(|| {
                let last = history
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                BackendError::NoFixture(last)
            })?;

        let turn = history[position + 1..]
            .iter()
            .filter(|m| m.role == "assistant")
            .count();
        responses
            .get(turn)
            .cloned()
            .ok_or_else(|| BackendError::Fixture(format!("responses for {:?} ran out after {}", prompt, turn)))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::hello_world()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn typing_events(&self) -> bool {
        false
    }

    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        let body = self.next_response(history)?;
        Ok(stream::iter(vec![Ok(ResponseDelta::Json(body))]).boxed())
    }

    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError> {
        let fields: ActionFields = serde_json::from_str(&response.json)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        fields.into_action()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responses_follow_assistant_turns() {
        let backend = MockBackend::hello_world();
        let mut history = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("write a hello world in python"),
        ];
        let first = backend.next_response(&history).unwrap();
        assert!(first.contains("print('hello world')"));

        history.push(ChatMessage::assistant(first));
        history.push(ChatMessage::user("Output:\nhello world!\n"));
        let second = backend.next_response(&history).unwrap();
        assert!(second.contains("this code prints"));

        history.push(ChatMessage::assistant(second));
        assert!(matches!(backend.next_response(&history), Err(BackendError::Fixture(_))));
    }

    #[test]
    fn test_unknown_prompt() {
        let backend = MockBackend::hello_world();
        let history = vec![ChatMessage::user("what is 2+2")];
        assert!(matches!(
            backend.next_response(&history),
            Err(BackendError::NoFixture(ref p)) if p == "what is 2+2"
        ));
    }

    #[test]
    fn test_from_json() {
        let backend = MockBackend::from_json(r#"{"hi": [{"explanation": "hello"}]}"#).unwrap();
        let body = backend.next_response(&[ChatMessage::user("hi")]).unwrap();
        let response = ModelResponse {
            json: body,
            ..ModelResponse::default()
        };
        assert_eq!(
            backend.parse_action(&response),
            Ok(Action::DirectMessage {
                text: "hello".to_string()
            })
        );
        assert!(MockBackend::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_no_typing_events() {
        assert!(!MockBackend::new().typing_events());
    }
}
