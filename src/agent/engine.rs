//! Agent Engine - the execute/observe loop
//!
//! One run of the engine drives the model and the kernel until the model
//! gives a final answer or the run hits a limit:
//!
//! ```text
//!   ┌──────────────► AwaitingModel ── input budget exceeded ──► terminal
//!   │                     │
//!   │            StreamingModelResponse ── typing events
//!   │                     │
//!   │                parse Action ── parse error ──► ModelOutputError
//!   │                     │
//!   │             output budget check ── exceeded ──► terminal
//!   │                     │
//!   │     Execute ◄───────┼───────► DirectMessage / NoAction / ShowSampleCode
//!   │        │                                 │
//!   └── observation + follow-up            FinalAnswer
//! ```
//!
//! Cancellation is checked before every model call and raced against every
//! model and kernel read. A cancelled run emits nothing further.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::backend::{Action, BackendError, ModelBackend, ModelResponse};
use super::events::{EventKind, EventSink, TaskContext};
use super::prompt::follow_up;
use super::typing::Typing;
use crate::config::{AgentConfig, TaskOptions};
use crate::kernel::{CodeKernel, ExecuteRequest, ExecuteResponse, KernelError};
use crate::llm::{estimate_text_tokens, estimate_tokens, ChatMessage};
use crate::metrics::{AGENT_ITERATIONS, AGENT_RUNS, MODEL_CALL_DURATION, MODEL_TOKENS};
use crate::output::TerminalBuffer;

/// Error type for agent runs
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("maximum iterations reached ({0})")]
    MaxIterationsReached(usize),
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    FinalAnswer,
    InputTokenLimitExceeded,
    OutputTokenLimitExceeded,
    ModelOutputError,
    SystemError,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::FinalAnswer => "final_answer",
            RunOutcome::InputTokenLimitExceeded => "input_token_limit",
            RunOutcome::OutputTokenLimitExceeded => "output_token_limit",
            RunOutcome::ModelOutputError => "model_output_error",
            RunOutcome::SystemError => "system_error",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// A runnable agent, independent of its backend
#[async_trait]
pub trait Agent: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn model(&self) -> &str;

    /// Run one prompt against the conversation in `history`
    ///
    /// Events go to `sink`; the history is extended with the turns of this run.
    async fn run(
        &self,
        history: &mut Vec<ChatMessage>,
        prompt: &str,
        options: TaskOptions,
        sink: &mut EventSink,
    ) -> Result<RunOutcome, AgentError>;
}

/// What one code execution produced
#[derive(Debug, Clone, Default)]
struct ExecutionOutput {
    stdout: String,
    stderr: String,
    traceback: Option<String>,
    files: Vec<String>,
}

impl ExecutionOutput {
    fn has_error(&self) -> bool {
        self.traceback.is_some()
    }

    /// Stderr and traceback together
    fn error_text(&self) -> String {
        let mut text = self.stderr.clone();
        if let Some(traceback) = &self.traceback {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(traceback);
        }
        text
    }
}

/// The agent loop over one backend and one kernel
pub struct AgentEngine<B: ModelBackend> {
    backend: B,
    kernel: Arc<dyn CodeKernel>,
    config: AgentConfig,
}

impl<B: ModelBackend> AgentEngine<B> {
    /// Create a new engine
    ///
    /// # Arguments
    /// * `backend` - Where model responses come from
    /// * `kernel` - Where code runs
    /// * `config` - Agent configuration
    pub fn new(backend: B, kernel: Arc<dyn CodeKernel>, config: AgentConfig) -> Self {
        Self {
            backend,
            kernel,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.backend.default_system_prompt().to_string())
    }

    async fn run_loop(
        &self,
        ctx: &mut TaskContext,
        history: &mut Vec<ChatMessage>,
        options: &TaskOptions,
        sink: &mut EventSink,
        trace_id: &str,
    ) -> Result<RunOutcome, AgentError> {
        let cancel = sink.cancel_token().clone();

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if ctx.iterations >= self.config.max_iterations {
                warn!(trace_id = %trace_id, iterations = ctx.iterations, "Max iterations reached");
                return Err(AgentError::MaxIterationsReached(ctx.iterations));
            }
            ctx.iterations += 1;

            let prompt_tokens = estimate_tokens(history);
            let projected = ctx.input_tokens.saturating_add(prompt_tokens);
            if projected > options.input_token_limit {
                warn!(trace_id = %trace_id, used = projected, limit = options.input_token_limit, "Input token limit exceeded");
                sink.emit(
                    ctx,
                    EventKind::InputTokenLimitExceeded {
                        limit: options.input_token_limit,
                        used: projected,
                    },
                )
                .await;
                return Ok(RunOutcome::InputTokenLimitExceeded);
            }

            let call_span = info_span!(
                "model_call",
                trace_id = %trace_id,
                iteration = ctx.iterations,
                backend = self.backend.name(),
                otel.name = "model_call"
            );
            let response = match self
                .stream_model(ctx, history, sink, &cancel)
                .instrument(call_span)
                .await?
            {
                Some(response) => response,
                None => return Ok(RunOutcome::Cancelled),
            };

            let (input, output) = match response.usage {
                Some(usage) => (usage.input_tokens, usage.output_tokens),
                None => (prompt_tokens, estimate_text_tokens(&response.written_text())),
            };
            ctx.add_input_tokens(input);
            ctx.add_output_tokens(output);
            MODEL_TOKENS.with_label_values(&[self.backend.name(), "input"]).inc_by(input as f64);
            MODEL_TOKENS.with_label_values(&[self.backend.name(), "output"]).inc_by(output as f64);

            let action = match self.backend.parse_action(&response) {
                Ok(action) => action,
                Err(e) => {
                    warn!(trace_id = %trace_id, error = %e, "Unparseable model response");
                    sink.emit(ctx, EventKind::ModelOutputError { message: e.to_string() }).await;
                    return Ok(RunOutcome::ModelOutputError);
                }
            };

            // Output is only checked between iterations, never mid-response
            if ctx.output_tokens > options.output_token_limit {
                warn!(trace_id = %trace_id, used = ctx.output_tokens, limit = options.output_token_limit, "Output token limit exceeded");
                sink.emit(
                    ctx,
                    EventKind::OutputTokenLimitExceeded {
                        limit: options.output_token_limit,
                        used: ctx.output_tokens,
                    },
                )
                .await;
                return Ok(RunOutcome::OutputTokenLimitExceeded);
            }

            match action {
                Action::Execute {
                    language,
                    code,
                    explanation,
                    saved_filenames,
                } => {
                    let exec_span = info_span!(
                        "code_execution",
                        trace_id = %trace_id,
                        language = %language,
                        code_len = code.len(),
                        otel.name = "code_execution"
                    );
                    let output = self
                        .execute(ctx, sink, &cancel, options, language, code, explanation, saved_filenames)
                        .instrument(exec_span)
                        .await?;
                    let Some(output) = output else {
                        return Ok(RunOutcome::Cancelled);
                    };
                    let observation = self.observation(&output);
                    self.backend.record_execution(
                        history,
                        &response,
                        &observation,
                        follow_up(output.has_error()),
                    );
                }
                Action::DirectMessage { text } => {
                    history.push(ChatMessage::assistant(text.clone()));
                    sink.emit(ctx, EventKind::FinalAnswer { answer: text }).await;
                    return Ok(RunOutcome::FinalAnswer);
                }
                Action::NoAction { explanation } => {
                    history.push(ChatMessage::assistant(explanation.clone()));
                    sink.emit(ctx, EventKind::FinalAnswer { answer: explanation }).await;
                    return Ok(RunOutcome::FinalAnswer);
                }
                Action::ShowSampleCode {
                    language,
                    code,
                    explanation,
                } => {
                    history.push(ChatMessage::assistant(format!(
                        "{}\n\n```{}\n{}\n```",
                        explanation, language, code
                    )));
                    sink.emit(
                        ctx,
                        EventKind::ActionStart {
                            language,
                            code,
                            explanation: explanation.clone(),
                            saved_filenames: Vec::new(),
                        },
                    )
                    .await;
                    sink.emit(ctx, EventKind::FinalAnswer { answer: explanation }).await;
                    return Ok(RunOutcome::FinalAnswer);
                }
            }
        }
    }

    /// Stream one model response, emitting typing events; `None` if cancelled
    async fn stream_model(
        &self,
        ctx: &mut TaskContext,
        history: &[ChatMessage],
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<Option<ModelResponse>, AgentError> {
        let started = Instant::now();
        let mut deltas = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            deltas = self.backend.stream_response(history) => deltas?,
        };

        let mut response = ModelResponse::default();
        let mut typing = Typing::new();
        loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                delta = deltas.next() => delta,
            };
            let Some(delta) = delta else { break };
            let delta = delta?;
            response.apply(&delta);
            if self.backend.typing_events() {
                for kind in typing.observe(&delta) {
                    sink.emit(ctx, kind).await;
                }
            }
        }

        let elapsed = started.elapsed();
        ctx.model_latency += elapsed;
        MODEL_CALL_DURATION
            .with_label_values(&[self.backend.name(), self.backend.model()])
            .observe(elapsed.as_secs_f64());
        debug!(duration_ms = elapsed.as_millis() as u64, "Model response complete");
        Ok(Some(response))
    }

    /// Run code and report it; `None` if cancelled
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        ctx: &mut TaskContext,
        sink: &mut EventSink,
        cancel: &CancellationToken,
        options: &TaskOptions,
        language: String,
        code: String,
        explanation: String,
        saved_filenames: Vec<String>,
    ) -> Result<Option<ExecutionOutput>, AgentError> {
        info!(language = %language, code_len = code.len(), "Executing code");
        sink.emit(
            ctx,
            EventKind::ActionStart {
                language: language.clone(),
                code: code.clone(),
                explanation,
                saved_filenames: saved_filenames.clone(),
            },
        )
        .await;

        let request = ExecuteRequest::new(code, language).with_read_timeout(options.read_timeout());
        let mut responses = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            responses = self.kernel.execute(request) => responses?,
        };

        let mut output = ExecutionOutput::default();
        let mut stdout = TerminalBuffer::default();
        let mut stderr = TerminalBuffer::default();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                item = responses.next() => item,
            };
            let Some(item) = item else { break };
            match item? {
                ExecuteResponse::Stdout(text) => {
                    let text = stdout.push(&text);
                    if options.streaming && !text.is_empty() {
                        sink.emit(ctx, EventKind::ActionStdout { text }).await;
                    }
                }
                ExecuteResponse::Stderr(text) => {
                    let text = stderr.push(&text);
                    if options.streaming && !text.is_empty() {
                        sink.emit(ctx, EventKind::ActionStderr { text }).await;
                    }
                }
                ExecuteResponse::Result(data) => {
                    let images: Vec<String> = data
                        .iter()
                        .filter(|(mime, _)| mime.starts_with("image/"))
                        .map(|(_, filename)| filename.clone())
                        .collect();
                    if images.is_empty() {
                        if let Some(plain) = data.get("text/plain") {
                            let mut text = plain.clone();
                            if !text.ends_with('\n') {
                                text.push('\n');
                            }
                            let text = stdout.push(&text);
                            if options.streaming && !text.is_empty() {
                                sink.emit(ctx, EventKind::ActionStdout { text }).await;
                            }
                        }
                    }
                    output.files.extend(images);
                }
                ExecuteResponse::Traceback(text) => {
                    let pending = stderr.flush();
                    if options.streaming {
                        if !pending.is_empty() {
                            sink.emit(ctx, EventKind::ActionStderr { text: pending }).await;
                        }
                        sink.emit(ctx, EventKind::ActionStderr { text: format!("{}\n", text) }).await;
                    }
                    output.traceback = Some(text);
                }
            }
        }

        // Unterminated last lines
        let rest = stdout.flush();
        if options.streaming && !rest.is_empty() {
            sink.emit(ctx, EventKind::ActionStdout { text: rest }).await;
        }
        let rest = stderr.flush();
        if options.streaming && !rest.is_empty() {
            sink.emit(ctx, EventKind::ActionStderr { text: rest }).await;
        }
        output.stdout = stdout.text().to_string();
        output.stderr = stderr.text().to_string();

        if !output.has_error() {
            for name in saved_filenames {
                if !output.files.contains(&name) {
                    output.files.push(name);
                }
            }
        }

        let error_text = output.error_text();
        sink.emit(
            ctx,
            EventKind::ActionEnd {
                output: (!options.streaming).then(|| output.stdout.clone()),
                error: (!options.streaming && !error_text.is_empty()).then_some(error_text),
                output_files: output.files.clone(),
                has_error: output.has_error(),
            },
        )
        .await;
        Ok(Some(output))
    }

    /// Text fed back to the model after an execution
    fn observation(&self, output: &ExecutionOutput) -> String {
        let mut text = String::new();
        if !output.stdout.is_empty() {
            text.push_str("Output:\n");
            text.push_str(&output.stdout);
            text.push('\n');
        }
        if !output.stderr.is_empty() {
            text.push_str("Stderr:\n");
            text.push_str(&output.stderr);
            text.push('\n');
        }
        if let Some(traceback) = &output.traceback {
            text.push_str("Error:\n");
            text.push_str(traceback);
            text.push('\n');
        }
        if !output.files.is_empty() {
            text.push_str("Files: ");
            text.push_str(&output.files.join(", "));
            text.push('\n');
        }
        if text.is_empty() {
            text.push_str("The code ran without output.");
        }
        truncate_chars(&text, self.config.max_observation_chars)
    }
}

#[async_trait]
impl<B: ModelBackend> Agent for AgentEngine<B> {
    fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn model(&self) -> &str {
        self.backend.model()
    }

    async fn run(
        &self,
        history: &mut Vec<ChatMessage>,
        prompt: &str,
        options: TaskOptions,
        sink: &mut EventSink,
    ) -> Result<RunOutcome, AgentError> {
        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_run",
            trace_id = %trace_id,
            backend = self.backend.name(),
            model = %self.backend.model(),
            otel.name = "agent_run"
        );

        async {
            info!(trace_id = %trace_id, prompt_len = prompt.len(), "Starting agent run");
            let mut ctx = TaskContext::new(self.backend.model());

            if history.is_empty() {
                history.push(ChatMessage::system(self.system_prompt()));
            }
            history.push(ChatMessage::user(prompt));

            let outcome = match self.run_loop(&mut ctx, history, &options, sink, &trace_id).await {
                Ok(outcome) => outcome,
                Err(_) if sink.is_cancelled() => RunOutcome::Cancelled,
                Err(e) => {
                    error!(trace_id = %trace_id, error = %e, "Agent run failed");
                    sink.emit(&ctx, EventKind::SystemError { message: e.to_string() }).await;
                    RunOutcome::SystemError
                }
            };
            let outcome = if sink.is_cancelled() {
                RunOutcome::Cancelled
            } else {
                outcome
            };

            AGENT_RUNS
                .with_label_values(&[self.backend.name(), outcome.as_str()])
                .inc();
            AGENT_ITERATIONS.observe(ctx.iterations as f64);
            info!(
                trace_id = %trace_id,
                outcome = outcome.as_str(),
                iterations = ctx.iterations,
                input_tokens = ctx.input_tokens,
                output_tokens = ctx.output_tokens,
                "Agent run finished"
            );
            Ok(outcome)
        }
        .instrument(root_span)
        .await
    }
}

/// Cut `text` to `max` characters, marking the cut
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n... (output truncated)", &text[..cut]),
        None => text.to_string(),
    }
}
