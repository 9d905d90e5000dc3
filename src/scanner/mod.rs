//! Incremental scanning of streamed model output
//!
//! - `tokenizer` - resumable JSON token automaton
//! - `extractor` - live `explanation` / `code` values from a partial object

pub mod extractor;
pub mod tokenizer;

pub use extractor::{ArgumentExtractor, Arguments, Field};
pub use tokenizer::{scan, scan_complete, Halt, Number, Partial, Scan, Scanner, State, Token};
