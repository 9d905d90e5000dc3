//! Streaming Response Bridge
//!
//! Turns one agent run into a transport-facing stream of [`StreamFrame`]s.
//!
//! ```text
//!   agent task ──EventSink──► [event channel] ──forwarder──► [frame channel] ──► EventStream
//!        ▲                                          │
//!        └───────────── CancellationToken ◄─────────┘ (send failure / drop / cancel())
//! ```
//!
//! The forwarder passes at most one terminal event, turns a failed or silent
//! run into a `system_error`, and always finishes with [`StreamFrame::End`].
//! Once the run is cancelled nothing but `End` is delivered.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::agent::{AgentError, ContextSnapshot, EventKind, EventSink, RunOutcome, Session, StreamEvent};
use crate::config::{BridgeConfig, TaskOptions};

/// One item of the outbound stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Event(StreamEvent),
    /// End of stream; always the last frame
    End,
}

impl StreamFrame {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamFrame::End)
    }

    /// JSON form for line-oriented transports; `End` is `{"type":"end"}`
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            StreamFrame::Event(event) => serde_json::to_string(event),
            StreamFrame::End => Ok(r#"{"type":"end"}"#.to_string()),
        }
    }
}

/// Outbound stream of one run
///
/// Dropping it cancels the run.
pub struct EventStream {
    inner: ReceiverStream<StreamFrame>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Stop the run; only `End` follows
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for EventStream {
    type Item = StreamFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamFrame>> {
        let this = self.get_mut();
        loop {
            let polled = Pin::new(&mut this.inner).poll_next(cx);
            match polled {
                // Events already queued when the client cancelled are dropped
                Poll::Ready(Some(StreamFrame::Event(_))) if this.cancel.is_cancelled() => continue,
                other => return other,
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ResponseBridge {
    config: BridgeConfig,
}

impl ResponseBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Spawn `task` with a fresh sink and stream its events
    ///
    /// # Arguments
    /// * `task` - Builds the run from the sink it must write events to
    pub fn run<F, Fut>(&self, task: F) -> EventStream
    where
        F: FnOnce(EventSink) -> Fut,
        Fut: Future<Output = Result<RunOutcome, AgentError>> + Send + 'static,
    {
        let capacity = self.config.channel_capacity.max(1);
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);

        let sink = EventSink::new(event_tx, cancel.clone());
        let handle = tokio::spawn(task(sink));

        let span = info_span!("bridge", otel.name = "bridge");
        tokio::spawn(forward(event_rx, frame_tx, handle, cancel.clone()).instrument(span));

        EventStream {
            inner: ReceiverStream::new(frame_rx),
            cancel,
        }
    }

    /// Run `prompt` on a session
    ///
    /// `options` are normalized first: absent or partial budgets fall back to
    /// the defaults as a whole.
    pub fn run_session(
        &self,
        session: Arc<Session>,
        prompt: impl Into<String>,
        options: Option<TaskOptions>,
    ) -> EventStream {
        let prompt = prompt.into();
        let options = TaskOptions::resolve(options);
        self.run(move |mut sink| async move { session.run(&prompt, options, &mut sink).await })
    }
}

impl Default for ResponseBridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

/// Move events from the run to the client, then close the stream
async fn forward(
    mut events: mpsc::Receiver<StreamEvent>,
    frames: mpsc::Sender<StreamFrame>,
    task: JoinHandle<Result<RunOutcome, AgentError>>,
    cancel: CancellationToken,
) {
    let mut terminated = false;
    let mut last_context = ContextSnapshot::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        if terminated {
            debug!(kind = event.kind.name(), "Dropping event after terminal");
            continue;
        }
        last_context = event.context.clone();
        terminated = event.is_terminal();

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = frames.send(StreamFrame::Event(event)) => result.is_ok(),
        };
        if !sent {
            debug!("Client went away, cancelling run");
            cancel.cancel();
            break;
        }
    }

    if cancel.is_cancelled() {
        // The run sees the token at its next suspension point
        drop(events);
        let _ = frames.send(StreamFrame::End).await;
        return;
    }

    let failure = match task.await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            error!(error = %e, "Agent run returned an error");
            Some(e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Agent task failed");
            Some(format!("agent task failed: {}", e))
        }
    };

    if !terminated {
        let message = failure.unwrap_or_else(|| {
            warn!("Run ended without a terminal event");
            "run ended without a terminal event".to_string()
        });
        let event = StreamEvent {
            context: last_context,
            kind: EventKind::SystemError { message },
        };
        let _ = frames.send(StreamFrame::Event(event)).await;
    }
    let _ = frames.send(StreamFrame::End).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TaskContext;
    use futures_util::StreamExt;

    async fn collect(stream: EventStream) -> Vec<StreamFrame> {
        stream.collect().await
    }

    fn kinds(frames: &[StreamFrame]) -> Vec<&'static str> {
        frames
            .iter()
            .map(|f| match f {
                StreamFrame::Event(e) => e.kind.name(),
                StreamFrame::End => "end",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_forwards_events_then_end() {
        let bridge = ResponseBridge::default();
        let stream = bridge.run(|mut sink| async move {
            let ctx = TaskContext::new("m");
            sink.emit(&ctx, EventKind::TypingText { text: "hi".into() }).await;
            sink.emit(&ctx, EventKind::FinalAnswer { answer: "done".into() }).await;
            Ok(RunOutcome::FinalAnswer)
        });
        let frames = collect(stream).await;
        assert_eq!(kinds(&frames), vec!["typing_text", "final_answer", "end"]);
    }

    #[tokio::test]
    async fn test_silent_run_gets_system_error() {
        let bridge = ResponseBridge::default();
        let stream = bridge.run(|_sink| async move { Ok(RunOutcome::FinalAnswer) });
        let frames = collect(stream).await;
        assert_eq!(kinds(&frames), vec!["system_error", "end"]);
    }

    #[tokio::test]
    async fn test_error_becomes_system_error() {
        let bridge = ResponseBridge::default();
        let stream = bridge.run(|_sink| async move { Err(AgentError::MaxIterationsReached(3)) });
        let frames = collect(stream).await;
        match &frames[0] {
            StreamFrame::Event(StreamEvent {
                kind: EventKind::SystemError { message },
                ..
            }) => assert!(message.contains("maximum iterations")),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(frames[1].is_end());
    }

    #[tokio::test]
    async fn test_end_json() {
        assert_eq!(StreamFrame::End.to_json().unwrap(), r#"{"type":"end"}"#);
    }
}
