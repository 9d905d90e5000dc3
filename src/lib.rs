//! codeloop - an LLM agent that writes code, runs it in a kernel, and streams what happens
//!
//! # Modules
//!
//! - `scanner` - incremental JSON token scanner and live argument extraction
//! - `kernel` - interpreter processes, their wire protocol, and output translation
//! - `llm` - chat message types and streaming model clients
//! - `agent` - model backends, the execute/observe loop, and sessions
//! - `bridge` - turns a run into a cancellable stream of events
//! - `workspace` - per-kernel file area and file transfer
//! - `output` - display text normalization
//! - `config` - configuration and per-task options
//! - `metrics` - Prometheus metrics
//! - `tracing` - logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use codeloop::{AgentEngine, Config, KernelManager, MockBackend, ResponseBridge, SessionRegistry};
//!
//! let config = Config::default();
//! let kernels = KernelManager::new(config.kernel.clone(), &config.workspace);
//! let sessions = SessionRegistry::new();
//! let session = sessions
//!     .bind("key", &kernels, "python3", |kernel| {
//!         Arc::new(AgentEngine::new(MockBackend::hello_world(), kernel, config.agent.clone()))
//!     })
//!     .await?;
//! let mut events = ResponseBridge::new(config.bridge.clone())
//!     .run_session(session, "write a hello world in python", None);
//! ```

pub mod agent;
pub mod bridge;
pub mod config;
pub mod kernel;
pub mod llm;
pub mod metrics;
pub mod output;
pub mod scanner;
pub mod tracing;
pub mod workspace;

pub use agent::{AgentEngine, EventKind, MockBackend, RunOutcome, SessionRegistry, StreamEvent};
pub use bridge::{EventStream, ResponseBridge, StreamFrame};
pub use config::{Config, TaskOptions};
pub use kernel::{CodeKernel, KernelManager};
