//! Conversation sessions and the registry that hands them out
//!
//! A session binds one API key to one agent and one running kernel. The
//! kernel is started when the session is bound, so a kernel that cannot
//! start rejects the binding instead of failing the first run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use super::engine::{Agent, AgentError, RunOutcome};
use super::events::EventSink;
use crate::config::TaskOptions;
use crate::kernel::{CodeKernel, KernelError, KernelManager};
use crate::llm::ChatMessage;

/// Error type for session binding
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("kernel failed to start: {0}")]
    KernelStart(#[from] KernelError),
}

/// One conversation
pub struct Session {
    id: String,
    kernel_name: String,
    created_at: SystemTime,
    agent: Arc<dyn Agent>,
    /// Held for the whole of a run, so runs on one session never overlap
    history: Mutex<Vec<ChatMessage>>,
}

impl Session {
    pub fn new(kernel_name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            kernel_name: kernel_name.into(),
            created_at: SystemTime::now(),
            agent,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Run one prompt; waits for any run already in progress on this session
    pub async fn run(
        &self,
        prompt: &str,
        options: TaskOptions,
        sink: &mut EventSink,
    ) -> Result<RunOutcome, AgentError> {
        let mut history = self.history.lock().await;
        self.agent.run(&mut history, prompt, options, sink).await
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }

    /// Forget the conversation; the kernel state is kept
    pub async fn reset(&self) {
        self.history.lock().await.clear();
    }

    pub async fn summary(&self) -> SessionSummary {
        let messages = self.history.lock().await.len();
        SessionSummary {
            id: self.id.clone(),
            kernel: self.kernel_name.clone(),
            backend: self.agent.backend_name().to_string(),
            model: self.agent.model().to_string(),
            created_at_secs: self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            messages,
        }
    }
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub kernel: String,
    pub backend: String,
    pub model: String,
    pub created_at_secs: u64,
    pub messages: usize,
}

/// Sessions by API key
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// One lock per key, held across a whole bind
    bind_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `api_key` to a session on the named kernel, starting it if needed
    ///
    /// An existing session for the key on the same kernel is returned as is.
    ///
    /// # Arguments
    /// * `api_key` - Client key the session belongs to
    /// * `manager` - Kernel manager to start the kernel with
    /// * `kernel_name` - Which kernel to bind
    /// * `make_agent` - Builds the agent around the started kernel
    pub async fn bind<F>(
        &self,
        api_key: &str,
        manager: &KernelManager,
        kernel_name: &str,
        make_agent: F,
    ) -> Result<Arc<Session>, SessionError>
    where
        F: FnOnce(Arc<dyn CodeKernel>) -> Arc<dyn Agent>,
    {
        let lock = self.bind_lock(api_key).await;
        let result = {
            let _guard = lock.lock().await;
            match self.reusable(api_key, kernel_name).await {
                Some(existing) => Ok(existing),
                None => match manager.start(kernel_name).await {
                    Ok(kernel) => {
                        let kernel: Arc<dyn CodeKernel> = kernel;
                        Ok(self.insert(api_key, kernel_name, make_agent(kernel)).await)
                    }
                    Err(e) => Err(SessionError::KernelStart(e)),
                },
            }
        };
        drop(lock);
        if result.is_err() {
            self.release_bind_lock(api_key).await;
        }
        result
    }

    /// Bind `api_key` to a session on an already running kernel
    pub async fn bind_kernel<F>(
        &self,
        api_key: &str,
        kernel: Arc<dyn CodeKernel>,
        make_agent: F,
    ) -> Arc<Session>
    where
        F: FnOnce(Arc<dyn CodeKernel>) -> Arc<dyn Agent>,
    {
        let lock = self.bind_lock(api_key).await;
        let _guard = lock.lock().await;

        let kernel_name = kernel.name().to_string();
        if let Some(existing) = self.reusable(api_key, &kernel_name).await {
            return existing;
        }
        self.insert(api_key, &kernel_name, make_agent(kernel)).await
    }

    pub async fn get(&self, api_key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(api_key).cloned()
    }

    /// Drop the session for `api_key`; the kernel keeps running
    pub async fn remove(&self, api_key: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().await.remove(api_key);
        if let Some(session) = &removed {
            info!(session = %session.id(), "Session removed");
        }
        self.release_bind_lock(api_key).await;
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn bind_lock(&self, api_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.bind_locks.lock().await;
        locks.entry(api_key.to_string()).or_default().clone()
    }

    /// Forget the bind lock for `api_key` once no bind holds it
    async fn release_bind_lock(&self, api_key: &str) {
        let mut locks = self.bind_locks.lock().await;
        if locks.get(api_key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(api_key);
        }
    }

    async fn reusable(&self, api_key: &str, kernel_name: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(api_key)
            .filter(|s| s.kernel_name() == kernel_name)
            .cloned()
    }

    async fn insert(&self, api_key: &str, kernel_name: &str, agent: Arc<dyn Agent>) -> Arc<Session> {
        let session = Arc::new(Session::new(kernel_name, agent));
        info!(session = %session.id(), kernel = kernel_name, backend = session.agent.backend_name(), "Session bound");
        self.sessions
            .lock()
            .await
            .insert(api_key.to_string(), session.clone());
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::AgentEngine;
    use crate::agent::mock::MockBackend;
    use crate::config::AgentConfig;
    use crate::kernel::{ExecuteRequest, ExecuteResponse, ResponseStream};
    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};

    struct EchoKernel;

    #[async_trait]
    impl CodeKernel for EchoKernel {
        fn name(&self) -> &str {
            "python3"
        }

        async fn execute(&self, _request: ExecuteRequest) -> Result<ResponseStream, KernelError> {
            Ok(stream::iter(vec![Ok(ExecuteResponse::Stdout("hello world!\n".to_string()))]).boxed())
        }

        fn is_alive(&self) -> bool {
            true
        }
    }

    fn mock_agent(kernel: Arc<dyn CodeKernel>) -> Arc<dyn Agent> {
        Arc::new(AgentEngine::new(MockBackend::hello_world(), kernel, AgentConfig::default()))
    }

    #[tokio::test]
    async fn test_bind_reuses_session() {
        let registry = SessionRegistry::new();
        let first = registry.bind_kernel("key-a", Arc::new(EchoKernel), mock_agent).await;
        let again = registry.bind_kernel("key-a", Arc::new(EchoKernel), mock_agent).await;
        let other = registry.bind_kernel("key-b", Arc::new(EchoKernel), mock_agent).await;

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other.id());
        assert_eq!(registry.len().await, 2);

        assert!(registry.remove("key-a").await.is_some());
        assert!(registry.get("key-a").await.is_none());
        assert_eq!(registry.len().await, 1);
        assert!(!registry.bind_locks.lock().await.contains_key("key-a"));
        assert!(registry.bind_locks.lock().await.contains_key("key-b"));
    }

    #[tokio::test]
    async fn test_bind_unknown_kernel_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::KernelConfig {
            state_dir: dir.path().join("state"),
            ..crate::config::KernelConfig::default()
        };
        let workspace = crate::config::WorkspaceConfig {
            root: dir.path().join("ws"),
            ..crate::config::WorkspaceConfig::default()
        };
        let manager = KernelManager::new(config, &workspace);
        let registry = SessionRegistry::new();

        let result = registry.bind("key", &manager, "cobol", mock_agent).await;
        assert!(matches!(
            result,
            Err(SessionError::KernelStart(KernelError::UnknownKernel(ref name))) if name == "cobol"
        ));
        assert!(registry.is_empty().await);
        assert!(registry.bind_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_session_keeps_history() {
        let session = Session::new("python3", mock_agent(Arc::new(EchoKernel)));
        let (mut sink, mut rx) = EventSink::channel(64);

        let outcome = session
            .run("write a hello world in python", TaskOptions::default(), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::FinalAnswer);

        let history = session.history().await;
        assert_eq!(history[0].role, "system");
        assert_eq!(history[1].content, "write a hello world in python");
        assert_eq!(history.last().map(|m| m.role.as_str()), Some("assistant"));

        let summary = session.summary().await;
        assert_eq!(summary.backend, "mock");
        assert_eq!(summary.messages, history.len());

        session.reset().await;
        assert!(session.history().await.is_empty());

        drop(sink);
        let mut terminals = 0;
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminals += 1;
            }
        }
        assert_eq!(terminals, 1);
    }
}
