//! Live extraction of `explanation` and `code` from a half-received response
//!
//! The model answers with a JSON object, but the UI wants to "type" the
//! explanation and code while the object is still arriving. The extractor
//! feeds every increment through the [`Scanner`] and tracks the keys it cares
//! about, reporting a string value that is still open as its best-known value.

use super::tokenizer::{Partial, Scanner, Token};

/// A field the extractor tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Explanation,
    Code,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "explanation" => Some(Field::Explanation),
            "code" | "action_input" => Some(Field::Code),
            _ => None,
        }
    }
}

/// Best-known values at a point in the stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    pub explanation: Option<String>,
    pub code: Option<String>,
}

impl Arguments {
    fn set(&mut self, field: Field, value: String) {
        match field {
            Field::Explanation => self.explanation = Some(value),
            Field::Code => self.code = Some(value),
        }
    }
}

#[derive(Debug, Default)]
pub struct ArgumentExtractor {
    scanner: Scanner,
    /// Tracked key seen, waiting for `:`
    key: Option<Field>,
    /// Tracked key and `:` seen, the next string is its value
    value_of: Option<Field>,
    values: Arguments,
}

impl ArgumentExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next increment and return the best-known values
    pub fn feed(&mut self, chunk: &str) -> Arguments {
        for token in self.scanner.feed(chunk) {
            self.observe(token);
        }
        if let (Some(field), Some(Partial::String(text))) = (self.value_of, self.scanner.partial()) {
            self.values.set(field, text);
        }
        self.values.clone()
    }

    pub fn current(&self) -> &Arguments {
        &self.values
    }

    /// True once the scanner gave up on the input
    pub fn is_halted(&self) -> bool {
        self.scanner.halted().is_some()
    }

    fn observe(&mut self, token: Token) {
        match token {
            Token::String(text) => {
                if let Some(field) = self.value_of.take() {
                    self.values.set(field, text);
                    self.key = None;
                } else {
                    self.key = Field::from_key(&text);
                }
            }
            Token::Operator(':') => {
                self.value_of = self.key.take();
            }
            _ => {
                self.key = None;
                self.value_of = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_partial_values() {
        let mut extractor = ArgumentExtractor::new();
        let args = extractor.feed(r#"{"explanation": "Let me co"#);
        assert_eq!(args.explanation.as_deref(), Some("Let me co"));
        assert_eq!(args.code, None);

        let args = extractor.feed(r#"mpute it", "code": "print(1"#);
        assert_eq!(args.explanation.as_deref(), Some("Let me compute it"));
        assert_eq!(args.code.as_deref(), Some("print(1"));

        let args = extractor.feed(r#"+1)"}"#);
        assert_eq!(args.code.as_deref(), Some("print(1+1)"));
    }

    #[test]
    fn test_action_input_is_code() {
        let mut extractor = ArgumentExtractor::new();
        let args = extractor.feed(
            r#"{"explanation": "x", "action": "execute_python_code", "action_input": "1+1"}"#,
        );
        assert_eq!(args.code.as_deref(), Some("1+1"));
    }

    #[test]
    fn test_values_grow_by_append_only() {
        let response = r#"{"explanation": "Use \"print\"\n", "code": "print(\"hello world\")\n", "language": "python"}"#;
        let mut extractor = ArgumentExtractor::new();
        let mut last = Arguments::default();
        for c in response.chars() {
            let args = extractor.feed(&c.to_string());
            for (before, after) in [
                (&last.explanation, &args.explanation),
                (&last.code, &args.code),
            ] {
                if let (Some(before), Some(after)) = (before, after) {
                    assert!(after.starts_with(before.as_str()), "{:?} -> {:?}", before, after);
                }
                if before.is_some() {
                    assert!(after.is_some());
                }
            }
            last = args;
        }
        assert_eq!(last.explanation.as_deref(), Some("Use \"print\"\n"));
        assert_eq!(last.code.as_deref(), Some("print(\"hello world\")\n"));
    }

    #[test]
    fn test_untracked_keys_and_values_are_ignored() {
        let mut extractor = ArgumentExtractor::new();
        let args = extractor.feed(r#"{"language": "code", "saved_filenames": ["explanation"]}"#);
        assert_eq!(args, Arguments::default());
    }

    #[test]
    fn test_keeps_values_after_halt() {
        let mut extractor = ArgumentExtractor::new();
        extractor.feed(r#"{"code": "ls"} garbage"#);
        assert!(extractor.is_halted());
        assert_eq!(extractor.current().code.as_deref(), Some("ls"));
    }
}
