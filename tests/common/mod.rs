//! Scripted kernel and model backend shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use codeloop::agent::backend::{ActionFields, DeltaStream};
use codeloop::agent::{
    Action, BackendError, EventKind, EventSink, ModelBackend, ModelResponse, ParseError,
    ResponseDelta, StreamEvent,
};
use codeloop::kernel::{CodeKernel, ExecuteRequest, ExecuteResponse, KernelError, ResponseStream};
use codeloop::llm::ChatMessage;

/// Kernel that answers each execution with the next scripted output
#[derive(Default)]
pub struct ScriptedKernel {
    outputs: Mutex<VecDeque<Vec<ExecuteResponse>>>,
    pub requests: Mutex<Vec<ExecuteRequest>>,
}

impl ScriptedKernel {
    pub fn new(outputs: Vec<Vec<ExecuteResponse>>) -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(outputs.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Prints `hello world!` for every execution
    pub fn hello() -> Arc<Self> {
        Self::new(vec![vec![ExecuteResponse::Stdout("hello world!\n".to_string())]; 8])
    }

    pub fn executed(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.code.clone()).collect()
    }
}

#[async_trait]
impl CodeKernel for ScriptedKernel {
    fn name(&self) -> &str {
        "python3"
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ResponseStream, KernelError> {
        self.requests.lock().unwrap().push(request);
        let output = self.outputs.lock().unwrap().pop_front().unwrap_or_default();
        Ok(stream::iter(output.into_iter().map(Ok)).boxed())
    }

    fn is_alive(&self) -> bool {
        true
    }
}

/// Kernel that prints one line, then never finishes or prints again
pub struct HangingKernel;

#[async_trait]
impl CodeKernel for HangingKernel {
    fn name(&self) -> &str {
        "python3"
    }

    async fn execute(&self, _request: ExecuteRequest) -> Result<ResponseStream, KernelError> {
        let first = stream::iter(vec![Ok(ExecuteResponse::Stdout("start\n".to_string()))]);
        Ok(first.chain(stream::pending()).boxed())
    }

    fn is_alive(&self) -> bool {
        true
    }
}

/// Backend whose response starts and then stalls forever
pub struct StalledBackend;

#[async_trait]
impl ModelBackend for StalledBackend {
    fn name(&self) -> &'static str {
        "stalled"
    }

    fn model(&self) -> &str {
        "stalled-model"
    }

    async fn stream_response(&self, _history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        let first = stream::iter(vec![Ok(ResponseDelta::Text("thinking".to_string()))]);
        Ok(first.chain(stream::pending()).boxed())
    }

    fn parse_action(&self, _response: &ModelResponse) -> Result<Action, ParseError> {
        Err(ParseError::Empty)
    }
}

/// Backend replaying scripted delta sequences, one per model call
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<Vec<ResponseDelta>>>,
    pub calls: AtomicUsize,
    pub histories: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<Vec<ResponseDelta>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            histories: Mutex::new(Vec::new()),
        }
    }

    /// One JSON body per call
    pub fn json(bodies: Vec<serde_json::Value>) -> Self {
        Self::new(
            bodies
                .into_iter()
                .map(|b| vec![ResponseDelta::Json(b.to_string())])
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().unwrap().push(history.to_vec());
        let deltas = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| BackendError::Fixture("script exhausted".to_string()))?;
        Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
    }

    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError> {
        if response.json.is_empty() {
            let text = response.text.trim();
            if text.is_empty() {
                return Err(ParseError::Empty);
            }
            return Ok(Action::DirectMessage { text: text.to_string() });
        }
        let fields: ActionFields = serde_json::from_str(&response.json)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        fields.into_action()
    }
}

/// Shares one backend between the engine and the test body
pub struct Shared(pub Arc<ScriptedBackend>);

#[async_trait]
impl ModelBackend for Shared {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn model(&self) -> &str {
        self.0.model()
    }

    async fn stream_response(&self, history: &[ChatMessage]) -> Result<DeltaStream, BackendError> {
        self.0.stream_response(history).await
    }

    fn parse_action(&self, response: &ModelResponse) -> Result<Action, ParseError> {
        self.0.parse_action(response)
    }
}

/// Everything a sink received, once the sender side is gone
pub async fn drain(sink: EventSink, mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<EventKind> {
    drop(sink);
    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(event.kind);
    }
    kinds
}

pub fn names(kinds: &[EventKind]) -> Vec<&'static str> {
    kinds.iter().map(|k| k.name()).collect()
}
