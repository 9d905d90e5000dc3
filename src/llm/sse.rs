//! Line framing for streamed HTTP bodies
//!
//! Providers stream either server-sent events (`data: {...}` lines separated
//! by blank lines) or bare JSON lines. Network chunks split lines anywhere,
//! including inside a multi-byte character, so bytes are buffered until a
//! newline arrives.

use futures_util::stream::{BoxStream, Stream, StreamExt};

use super::LlmError;

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes and return every line they complete (without terminators)
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The unterminated tail, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

/// Payload of an SSE `data:` line, or the line itself for bare JSON lines
///
/// Returns `None` for blank lines, comments and other SSE fields.
pub fn data_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        let rest = rest.trim_start();
        return (!rest.is_empty()).then_some(rest);
    }
    if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
        return None;
    }
    Some(line)
}

/// Turn a response body into a stream of payloads
pub fn payloads<S, B>(body: S) -> BoxStream<'static, Result<String, LlmError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut buffer = LineBuffer::new();
        let mut body = Box::pin(body);
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for line in buffer.push(bytes.as_ref()) {
                        if let Some(payload) = data_payload(&line) {
                            yield Ok(payload.to_string());
                        }
                    }
                }
                Err(e) => {
                    yield Err(LlmError::Request(e));
                    return;
                }
            }
        }
        if let Some(tail) = buffer.finish() {
            if let Some(payload) = data_payload(&tail) {
                yield Ok(payload.to_string());
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.push(b": 1}\r\n\r\ndata: [DO"), vec!["data: {\"a\": 1}", ""]);
        assert_eq!(buffer.push(b"NE]\n"), vec!["data: [DONE]"]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_multibyte_character_split() {
        let mut buffer = LineBuffer::new();
        let text = "é\n".as_bytes();
        assert!(buffer.push(&text[..1]).is_empty());
        assert_eq!(buffer.push(&text[1..]), vec!["é"]);
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(data_payload("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("{\"content\":\"a\"}"), Some("{\"content\":\"a\"}"));
        assert_eq!(data_payload(""), None);
        assert_eq!(data_payload(": keep-alive"), None);
        assert_eq!(data_payload("event: message"), None);
    }

    #[tokio::test]
    async fn test_payloads_stream() {
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(b"data: one\n\nda".to_vec()),
            Ok(b"ta: two\n\n".to_vec()),
            Ok(b"{\"tail\": true}".to_vec()),
        ];
        let out: Vec<String> = payloads(futures_util::stream::iter(chunks))
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec!["one", "two", "{\"tail\": true}"]);
    }
}
