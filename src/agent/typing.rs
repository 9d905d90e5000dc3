//! Typing events from a half-received response
//!
//! Clients render the explanation and code "as typed". Only the newly
//! appended part of each value is sent; a value that stops extending what was
//! sent before (a new object started) is sent whole.

use super::backend::ResponseDelta;
use super::events::EventKind;
use crate::scanner::ArgumentExtractor;

#[derive(Debug, Default)]
pub struct Typing {
    extractor: ArgumentExtractor,
    explanation: String,
    code: String,
    /// Only the first tool call drives typing
    tool_index: Option<usize>,
}

impl Typing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for one response increment
    pub fn observe(&mut self, delta: &ResponseDelta) -> Vec<EventKind> {
        match delta {
            ResponseDelta::Text(text) if !text.is_empty() => {
                vec![EventKind::TypingText { text: text.clone() }]
            }
            ResponseDelta::Json(text) => self.feed(text),
            ResponseDelta::ToolCall {
                index,
                arguments: Some(arguments),
                ..
            } => {
                if *self.tool_index.get_or_insert(*index) != *index {
                    return Vec::new();
                }
                self.feed(arguments)
            }
            _ => Vec::new(),
        }
    }

    fn feed(&mut self, chunk: &str) -> Vec<EventKind> {
        let args = self.extractor.feed(chunk);
        let mut events = Vec::new();
        if let Some(text) = appended(&mut self.explanation, args.explanation) {
            events.push(EventKind::TypingText { text });
        }
        if let Some(text) = appended(&mut self.code, args.code) {
            events.push(EventKind::TypingCode { text });
        }
        events
    }
}

/// The part of `current` not yet sent, updating what was sent
fn appended(sent: &mut String, current: Option<String>) -> Option<String> {
    let current = current?;
    let new_text = match current.strip_prefix(sent.as_str()) {
        Some(suffix) => suffix.to_string(),
        None => current.clone(),
    };
    *sent = current;
    (!new_text.is_empty()).then_some(new_text)
}
