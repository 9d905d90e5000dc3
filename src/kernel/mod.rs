//! Code execution kernels
//!
//! A kernel is a long-lived interpreter process with a persistent namespace.
//! The [`KernelManager`] starts and stops them by name; a [`KernelHandle`]
//! executes code and yields normalized [`ExecuteResponse`]s.

pub mod client;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod translator;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::workspace::WorkspaceError;

pub use client::{Execution, KernelClient};
pub use manager::{KernelHandle, KernelManager, StopStatus};
pub use protocol::{ConnectionInfo, KernelMessage};
pub use translator::{translate, ExecuteResponse, TranslateError};

/// Error type for kernel operations
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("no kernel named {0} is configured")]
    UnknownKernel(String),
    #[error("failed to spawn kernel {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("kernel {name} exited during startup ({status})")]
    Exited { name: String, status: String },
    #[error("kernel {name} did not write its connection file within {waited:?}")]
    StartTimeout { name: String, waited: Duration },
    #[error("kernel {name} did not answer kernel_info within {waited:?}")]
    NotReady { name: String, waited: Duration },
    #[error("kernel {0} channel closed")]
    ChannelClosed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Stream of normalized outputs for one execution
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ExecuteResponse, KernelError>> + Send>>;

/// Code to run in a kernel
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    /// Silence after which the output stream ends; `None` uses the kernel default
    pub read_timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Something that runs code and streams back its output
///
/// Implemented by [`KernelHandle`] for real interpreter processes; the agent
/// engine only sees this trait.
#[async_trait]
pub trait CodeKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Submit code; outputs arrive in kernel order
    async fn execute(&self, request: ExecuteRequest) -> Result<ResponseStream, KernelError>;

    fn is_alive(&self) -> bool;
}
