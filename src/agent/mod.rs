//! Agent layer: model backends, the execute/observe loop, and sessions
//!
//! # Architecture
//!
//! ```text
//! Session::run(prompt) → AgentEngine
//!                  ↓
//!           ModelBackend::stream_response (openai | grammar | mock)
//!                  ↓                        ↘ Typing → typing_text / typing_code
//!           ModelBackend::parse_action
//!                  ↓
//!           CodeKernel::execute → action_start / action_stdout / action_end
//!                  ↓
//!           observation + follow-up → history → loop
//!                  ↓
//!           final_answer | limit exceeded | model_output_error | system_error
//! ```
//!
//! Every event goes through an [`EventSink`]; the bridge turns the sink's
//! channel into a client stream.

pub mod backend;
pub mod engine;
pub mod events;
pub mod grammar;
pub mod mock;
pub mod openai;
pub mod prompt;
pub mod sessions;
pub mod typing;

pub use backend::{Action, BackendError, ModelBackend, ModelResponse, ParseError, ResponseDelta};
pub use engine::{Agent, AgentEngine, AgentError, RunOutcome};
pub use events::{ContextSnapshot, EventKind, EventSink, StreamEvent, TaskContext};
pub use grammar::GrammarBackend;
pub use mock::MockBackend;
pub use openai::FunctionCallingBackend;
pub use sessions::{Session, SessionError, SessionRegistry, SessionSummary};
