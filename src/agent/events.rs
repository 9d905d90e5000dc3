//! Run context and the events a run emits
//!
//! Every [`StreamEvent`] carries a [`ContextSnapshot`] of the run's counters
//! at the moment it was produced, so clients can show progress without a
//! separate channel.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::AGENT_EVENTS;

/// Per-run counters, owned by the engine
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub iterations: usize,
    pub started: Instant,
    /// Time spent waiting on model responses
    pub model_latency: Duration,
    pub model: String,
}

impl TaskContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            iterations: 0,
            started: Instant::now(),
            model_latency: Duration::ZERO,
            model: model.into(),
        }
    }

    pub fn add_input_tokens(&mut self, tokens: u64) {
        self.input_tokens = self.input_tokens.saturating_add(tokens);
    }

    pub fn add_output_tokens(&mut self, tokens: u64) {
        self.output_tokens = self.output_tokens.saturating_add(tokens);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            iterations: self.iterations,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            model_latency_ms: self.model_latency.as_millis() as u64,
            model: self.model.clone(),
        }
    }
}

/// Serializable copy of a [`TaskContext`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub iterations: usize,
    pub elapsed_ms: u64,
    pub model_latency_ms: u64,
    pub model: String,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Newly arrived explanation text
    TypingText { text: String },
    /// Newly arrived code text
    TypingCode { text: String },
    ActionStart {
        language: String,
        code: String,
        explanation: String,
        saved_filenames: Vec<String>,
    },
    ActionStdout { text: String },
    ActionStderr { text: String },
    ActionEnd {
        /// Full stdout, when increments were not streamed
        output: Option<String>,
        /// Full stderr and traceback, when increments were not streamed
        error: Option<String>,
        output_files: Vec<String>,
        has_error: bool,
    },
    FinalAnswer { answer: String },
    InputTokenLimitExceeded { limit: u64, used: u64 },
    OutputTokenLimitExceeded { limit: u64, used: u64 },
    ModelOutputError { message: String },
    SystemError { message: String },
}

impl EventKind {
    /// True for the events that end a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::FinalAnswer { .. }
                | EventKind::InputTokenLimitExceeded { .. }
                | EventKind::OutputTokenLimitExceeded { .. }
                | EventKind::ModelOutputError { .. }
                | EventKind::SystemError { .. }
        )
    }

    /// Snake-case name, as serialized
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TypingText { .. } => "typing_text",
            EventKind::TypingCode { .. } => "typing_code",
            EventKind::ActionStart { .. } => "action_start",
            EventKind::ActionStdout { .. } => "action_stdout",
            EventKind::ActionStderr { .. } => "action_stderr",
            EventKind::ActionEnd { .. } => "action_end",
            EventKind::FinalAnswer { .. } => "final_answer",
            EventKind::InputTokenLimitExceeded { .. } => "input_token_limit_exceeded",
            EventKind::OutputTokenLimitExceeded { .. } => "output_token_limit_exceeded",
            EventKind::ModelOutputError { .. } => "model_output_error",
            EventKind::SystemError { .. } => "system_error",
        }
    }
}

/// One event with the run state it was emitted in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    pub context: ContextSnapshot,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Write side of a run's event channel
///
/// Content stops flowing once the run is cancelled or a terminal event went
/// out. A closed receiver cancels the run.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    terminated: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            terminated: false,
        }
    }

    /// Sink plus the receiving end, with a fresh token
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, CancellationToken::new()), rx)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once a terminal event was sent
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Send an event; returns false if it was dropped
    pub async fn emit(&mut self, context: &TaskContext, kind: EventKind) -> bool {
        if self.terminated || self.cancel.is_cancelled() {
            debug!(kind = kind.name(), "Dropping event after end of run");
            return false;
        }
        let terminal = kind.is_terminal();
        let name = kind.name();
        let event = StreamEvent {
            context: context.snapshot(),
            kind,
        };

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.tx.send(event) => result.is_ok(),
        };
        if !sent {
            if !self.cancel.is_cancelled() {
                debug!("Event receiver gone, cancelling run");
                self.cancel.cancel();
            }
            return false;
        }

        AGENT_EVENTS.with_label_values(&[name]).inc();
        if terminal {
            self.terminated = true;
        }
        true
    }
}
