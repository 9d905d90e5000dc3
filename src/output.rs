//! Terminal output normalization
//!
//! Kernel output is written for a terminal: colored tracebacks, progress bars
//! redrawn with `\r`, spinners erased with backspace. Clients get plain text.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// CSI sequences (colors, cursor movement) and OSC sequences (titles, links)
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI escape pattern is valid");
}

/// Remove ANSI escape sequences
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Strip ANSI escapes, then replay carriage returns and backspaces the way a
/// terminal would: `\r` moves to the start of the line and later characters
/// overwrite, `\x08` moves one column left.
pub fn normalize(text: &str) -> String {
    let stripped = strip_ansi(text);
    let mut out = String::with_capacity(stripped.len());
    let mut line: Vec<char> = Vec::new();
    let mut cursor = 0usize;

    for c in stripped.chars() {
        match c {
            '\n' => {
                out.extend(line.drain(..));
                out.push('\n');
                cursor = 0;
            }
            '\r' => cursor = 0,
            '\u{8}' => cursor = cursor.saturating_sub(1),
            _ => {
                if cursor < line.len() {
                    line[cursor] = c;
                } else {
                    line.push(c);
                }
                cursor += 1;
            }
        }
    }
    out.extend(line);
    out
}

/// Normalized view of one output stream that arrives in chunks
///
/// Text is committed a line at a time. A `\r` or backspace in a later chunk
/// still rewrites the unfinished line it belongs to.
#[derive(Debug, Clone, Default)]
pub struct TerminalBuffer {
    committed: String,
    pending: String,
}

impl TerminalBuffer {
    /// Add raw output; returns the normalized text of the lines it completed
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        match self.pending.rfind('\n') {
            Some(end) => {
                let lines: String = self.pending.drain(..=end).collect();
                self.commit(&lines)
            }
            None => String::new(),
        }
    }

    /// Commit the unfinished last line
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        self.commit(&rest)
    }

    /// Everything committed so far
    pub fn text(&self) -> &str {
        &self.committed
    }

    fn commit(&mut self, raw: &str) -> String {
        let text = normalize(raw);
        self.committed.push_str(&text);
        text
    }
}
