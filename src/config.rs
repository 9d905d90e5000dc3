//! Runtime configuration
//!
//! One [`Config`] is built at startup (by the CLI or the embedding service)
//! and passed by reference to each component. Per-request knobs live in
//! [`TaskOptions`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default token ceilings applied when a request leaves them unset
pub const DEFAULT_INPUT_TOKEN_LIMIT: u64 = 4000;
pub const DEFAULT_OUTPUT_TOKEN_LIMIT: u64 = 4000;

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub agent: AgentConfig,
    pub kernel: KernelConfig,
    pub bridge: BridgeConfig,
    pub workspace: WorkspaceConfig,
}

/// Configuration for the agent engine
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model name sent to the provider (e.g., "gpt-4o-mini")
    pub model: String,
    /// Maximum number of model calls in one run
    pub max_iterations: usize,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
    /// Kernel output longer than this is cut before it goes back to the model
    pub max_observation_chars: usize,
    /// Upper bound on tokens generated per grammar completion call
    pub max_completion_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_iterations: 10,
            system_prompt: None,
            max_observation_chars: 4000,
            max_completion_tokens: 2048,
        }
    }
}

/// How to launch one kind of kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSpec {
    /// Interpreter binary
    pub program: String,
    /// Arguments placed before the kernel script path
    pub args: Vec<String>,
}

/// Configuration for kernel processes
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Launch specs by kernel name
    pub kernels: HashMap<String, KernelSpec>,
    /// Directory for connection files and the kernel script
    pub state_dir: PathBuf,
    /// First delay while waiting for the connection file (doubles each try)
    pub connect_backoff: Duration,
    /// Largest delay between connection file checks
    pub connect_backoff_max: Duration,
    /// Give up starting a kernel after this long
    pub start_timeout: Duration,
    /// How long one poll of the message channel waits
    pub poll_interval: Duration,
    /// Consecutive empty polls that end a response
    pub max_empty_polls: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let mut kernels = HashMap::new();
        kernels.insert(
            "python3".to_string(),
            KernelSpec {
                program: "python3".to_string(),
                args: vec!["-u".to_string()],
            },
        );
        Self {
            kernels,
            state_dir: std::env::temp_dir().join("codeloop").join("kernels"),
            connect_backoff: Duration::from_millis(50),
            connect_backoff_max: Duration::from_secs(1),
            start_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
            max_empty_polls: 150,
        }
    }
}

/// Configuration for the streaming bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Capacity of the bounded event channels
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

/// Configuration for kernel workspaces and file transfer
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root directory; each kernel gets a subdirectory
    pub root: PathBuf,
    /// Upload ceiling in bytes across all chunks of one transfer
    pub max_upload_bytes: u64,
    /// Download chunk size
    pub chunk_size: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("codeloop").join("workspace"),
            max_upload_bytes: 20 * 1024 * 1024,
            chunk_size: 128 * 1024,
        }
    }
}

/// Per-request execution options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Stream stdout/stderr increments instead of attaching them to ActionEnd
    pub streaming: bool,
    pub input_token_limit: u64,
    pub output_token_limit: u64,
    /// Seconds the kernel read loop waits for more output (0 = kernel default)
    pub timeout_secs: u64,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            streaming: true,
            input_token_limit: DEFAULT_INPUT_TOKEN_LIMIT,
            output_token_limit: DEFAULT_OUTPUT_TOKEN_LIMIT,
            timeout_secs: 0,
        }
    }
}

impl TaskOptions {
    /// Resolve request options: absent options or any zero token limit fall
    /// back to the defaults as a whole
    pub fn resolve(requested: Option<TaskOptions>) -> TaskOptions {
        match requested {
            Some(options) if options.input_token_limit > 0 && options.output_token_limit > 0 => {
                options
            }
            _ => TaskOptions::default(),
        }
    }

    /// Idle wait for the kernel read loop, if the request set one
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_options_defaults() {
        let options = TaskOptions::resolve(None);
        assert!(options.streaming);
        assert_eq!(options.input_token_limit, 4000);
        assert_eq!(options.output_token_limit, 4000);
        assert_eq!(options.read_timeout(), None);
    }

    #[test]
    fn test_task_options_all_or_nothing() {
        let partial = TaskOptions {
            streaming: false,
            input_token_limit: 100,
            output_token_limit: 0,
            timeout_secs: 5,
        };
        assert_eq!(TaskOptions::resolve(Some(partial)), TaskOptions::default());

        let full = TaskOptions {
            output_token_limit: 200,
            ..partial
        };
        let resolved = TaskOptions::resolve(Some(full));
        assert!(!resolved.streaming);
        assert_eq!(resolved.input_token_limit, 100);
        assert_eq!(resolved.read_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_default_kernel_spec() {
        let config = KernelConfig::default();
        let spec = &config.kernels["python3"];
        assert_eq!(spec.program, "python3");
        assert!(config.max_empty_polls > 0);
    }
}
