//! Kernel Manager - starts, tracks and stops kernel processes
//!
//! The KernelManager is responsible for:
//! - Spawning kernel processes from their configured launch spec
//! - Waiting for each kernel to write its connection file and answer kernel_info
//! - Keeping one live kernel per name (a dead one is restarted on next start)
//! - Serializing concurrent starts and stops of the same name

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::KernelClient;
use super::process::{
    connection_file_path, forward_stderr, install_script, spawn_kernel, wait_for_connection_file,
};
use super::protocol::ConnectionInfo;
use super::translator::{stores_files, translate, ExecuteResponse};
use super::{CodeKernel, ExecuteRequest, KernelError, ResponseStream};
use crate::config::{KernelConfig, WorkspaceConfig};
use crate::metrics::{
    KERNELS_RUNNING, KERNEL_EXECUTIONS, KERNEL_EXECUTION_DURATION, KERNEL_STARTS,
    KERNEL_START_DURATION,
};
use crate::workspace::{Workspace, WorkspaceError};

/// Outcome of [`KernelManager::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    Stopped,
    NoKernel,
}

/// A running kernel
pub struct KernelHandle {
    name: String,
    info: ConnectionInfo,
    connection_file: PathBuf,
    client: KernelClient,
    workspace: Workspace,
    /// Taken on shutdown
    child: std::sync::Mutex<Option<Child>>,
}

impl KernelHandle {
    /// Spawn a kernel and wait until it answers
    ///
    /// # Arguments
    /// * `name` - Kernel name; must have a launch spec in `config.kernels`
    /// * `config` - Kernel configuration
    /// * `workspace` - Directory the kernel runs in
    pub async fn launch(
        name: &str,
        config: &KernelConfig,
        workspace: Workspace,
    ) -> Result<Self, KernelError> {
        let spec = config
            .kernels
            .get(name)
            .ok_or_else(|| KernelError::UnknownKernel(name.to_string()))?;

        let script = install_script(&config.state_dir).await?;
        let connection_file = connection_file_path(&config.state_dir, name);
        let mut child = spawn_kernel(name, spec, &script, &connection_file, workspace.root())?;

        match Self::connect(name, config, &connection_file, &mut child).await {
            Ok((info, client)) => Ok(Self {
                name: name.to_string(),
                info,
                connection_file,
                client,
                workspace,
                child: std::sync::Mutex::new(Some(child)),
            }),
            Err(e) => {
                // The child is killed on drop; its connection file is not
                if let Err(remove_err) = tokio::fs::remove_file(&connection_file).await {
                    debug!(kernel = name, error = %remove_err, "No connection file to remove");
                }
                Err(e)
            }
        }
    }

    /// Wait for a spawned kernel to announce itself and answer kernel_info
    async fn connect(
        name: &str,
        config: &KernelConfig,
        connection_file: &Path,
        child: &mut Child,
    ) -> Result<(ConnectionInfo, KernelClient), KernelError> {
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(name, stderr);
        }
        let stdin = child.stdin.take().ok_or_else(|| KernelError::ChannelClosed(name.to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| KernelError::ChannelClosed(name.to_string()))?;

        let start = Instant::now();
        let info = wait_for_connection_file(name, connection_file, child, config).await?;
        let client = KernelClient::connect(
            name,
            stdout,
            stdin,
            config.poll_interval,
            config.max_empty_polls,
        );
        let remaining = config.start_timeout.saturating_sub(start.elapsed());
        client.wait_ready(remaining).await?;
        Ok((info, client))
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Ask the kernel to exit, then kill it and remove its connection file
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        let child = match self.child.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(kernel = %self.name, error = %e, "Kernel already gone");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.connection_file).await {
            debug!(kernel = %self.name, error = %e, "Connection file not removed");
        }
    }
}

#[async_trait]
impl CodeKernel for KernelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: ExecuteRequest) -> Result<ResponseStream, KernelError> {
        let execution = self
            .client
            .execute(&request.code, &request.language, request.read_timeout)
            .await?;
        let workspace = self.workspace.clone();
        let language = request.language;
        let mut messages = execution.messages;
        let msg_id = execution.msg_id;

        let stream = async_stream::stream! {
            let start = Instant::now();
            let mut failed = false;
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        failed = true;
                        yield Err(e);
                        break;
                    }
                };
                let translated = if stores_files(&message) {
                    let workspace = workspace.clone();
                    let image_message = message.clone();
                    match tokio::task::spawn_blocking(move || translate(&image_message, &workspace)).await {
                        Ok(translated) => translated,
                        Err(e) => {
                            warn!(msg_id = %msg_id, error = %e, "Image output task failed");
                            continue;
                        }
                    }
                } else {
                    translate(&message, &workspace)
                };
                match translated {
                    Ok(Some(response)) => {
                        if matches!(response, ExecuteResponse::Traceback(_)) {
                            failed = true;
                        }
                        yield Ok(response);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(msg_id = %msg_id, msg_type = %message.msg_type, error = %e, "Skipping untranslatable kernel message");
                    }
                }
            }
            let status = if failed { "error" } else { "ok" };
            KERNEL_EXECUTIONS.with_label_values(&[&language, status]).inc();
            KERNEL_EXECUTION_DURATION
                .with_label_values(&[&language])
                .observe(start.elapsed().as_secs_f64());
        };
        Ok(Box::pin(stream))
    }

    fn is_alive(&self) -> bool {
        if !self.client.is_connected() {
            return false;
        }
        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Starts and stops kernels by name
pub struct KernelManager {
    config: KernelConfig,
    workspace_root: PathBuf,
    kernels: Mutex<HashMap<String, Arc<KernelHandle>>>,
    /// One lock per kernel name, held across a whole start or stop
    name_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KernelManager {
    pub fn new(config: KernelConfig, workspace: &WorkspaceConfig) -> Self {
        Self {
            config,
            workspace_root: workspace.root.clone(),
            kernels: Mutex::new(HashMap::new()),
            name_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The workspace the named kernel runs in, running or not
    pub fn workspace(&self, name: &str) -> Result<Workspace, WorkspaceError> {
        Workspace::create(self.workspace_root.join(name))
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.name_locks.lock().await;
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Forget the lock for `name` once no start or stop holds it
    async fn release_name_lock(&self, name: &str) {
        let mut locks = self.name_locks.lock().await;
        if locks.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(name);
        }
    }

    /// Start the named kernel, or return it if already running
    ///
    /// Concurrent calls for one name share a single process.
    pub async fn start(&self, name: &str) -> Result<Arc<KernelHandle>, KernelError> {
        let lock = self.name_lock(name).await;
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(name).await
        };
        drop(lock);
        if result.is_err() {
            self.release_name_lock(name).await;
        }
        result
    }

    async fn start_locked(&self, name: &str) -> Result<Arc<KernelHandle>, KernelError> {
        let existing = self.kernels.lock().await.get(name).cloned();
        if let Some(existing) = existing {
            if existing.is_alive() {
                debug!(kernel = name, "Kernel already running");
                return Ok(existing);
            }
            warn!(kernel = name, "Kernel died, restarting");
            self.kernels.lock().await.remove(name);
            KERNELS_RUNNING.dec();
            existing.shutdown().await;
        }

        let workspace = self.workspace(name)?;
        let start = Instant::now();
        match KernelHandle::launch(name, &self.config, workspace).await {
            Ok(handle) => {
                let elapsed = start.elapsed();
                KERNEL_STARTS.with_label_values(&[name, "ok"]).inc();
                KERNEL_START_DURATION.observe(elapsed.as_secs_f64());
                KERNELS_RUNNING.inc();
                info!(kernel = name, pid = handle.info().pid, start_ms = elapsed.as_millis() as u64, "Kernel started");

                let handle = Arc::new(handle);
                self.kernels.lock().await.insert(name.to_string(), handle.clone());
                Ok(handle)
            }
            Err(e) => {
                KERNEL_STARTS.with_label_values(&[name, "error"]).inc();
                warn!(kernel = name, error = %e, "Kernel failed to start");
                Err(e)
            }
        }
    }

    /// Stop the named kernel
    pub async fn stop(&self, name: &str) -> StopStatus {
        let lock = self.name_lock(name).await;
        let status = {
            let _guard = lock.lock().await;
            let removed = self.kernels.lock().await.remove(name);
            match removed {
                Some(handle) => {
                    handle.shutdown().await;
                    KERNELS_RUNNING.dec();
                    info!(kernel = name, "Kernel stopped");
                    StopStatus::Stopped
                }
                None => StopStatus::NoKernel,
            }
        };
        drop(lock);
        self.release_name_lock(name).await;
        status
    }

    pub async fn get(&self, name: &str) -> Option<Arc<KernelHandle>> {
        self.kernels.lock().await.get(name).cloned()
    }

    /// Names of registered kernels
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kernels.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every kernel
    pub async fn shutdown_all(&self) {
        for name in self.names().await {
            self.stop(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelSpec;
    use std::time::Duration;

    fn manager(dir: &std::path::Path, spec: Option<KernelSpec>) -> KernelManager {
        let mut config = KernelConfig {
            state_dir: dir.join("state"),
            start_timeout: Duration::from_secs(2),
            ..KernelConfig::default()
        };
        if let Some(spec) = spec {
            config.kernels.insert("fake".to_string(), spec);
        }
        let workspace = WorkspaceConfig {
            root: dir.join("workspace"),
            ..WorkspaceConfig::default()
        };
        KernelManager::new(config, &workspace)
    }

    #[tokio::test]
    async fn test_unknown_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None);
        assert!(matches!(manager.start("ruby").await, Err(KernelError::UnknownKernel(_))));
        assert!(manager.name_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_kernel() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), None);
        assert_eq!(manager.stop("python3").await, StopStatus::NoKernel);
        assert!(manager.name_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_kernel_that_exits_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c 'exit 1' <script> ...` exits before writing a connection file
        let spec = KernelSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 1".to_string()],
        };
        let manager = manager(dir.path(), Some(spec));
        assert!(matches!(manager.start("fake").await, Err(KernelError::Exited { .. })));
        assert!(manager.get("fake").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_handshake_removes_connection_file() {
        let dir = tempfile::tempdir().unwrap();
        // Announces itself through the connection file ($3), then never answers
        let spec = KernelSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"printf '{"kernel_name": "fake", "pid": 1}' > "$3"; sleep 30"#.to_string(),
                "sh".to_string(),
            ],
        };
        let manager = manager(dir.path(), Some(spec));

        assert!(matches!(manager.start("fake").await, Err(KernelError::NotReady { .. })));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("kernel-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
