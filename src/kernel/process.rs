//! Kernel subprocess launch
//!
//! Functions for spawning a kernel process and waiting for it to announce
//! itself through its connection file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::ConnectionInfo;
use super::KernelError;
use crate::config::{KernelConfig, KernelSpec};

/// Source of the kernel program, written next to the connection files
const KERNEL_SCRIPT: &str = include_str!("kernel.py");
const KERNEL_SCRIPT_NAME: &str = "codeloop_kernel.py";

/// Write the kernel script into `state_dir` and return its path
pub async fn install_script(state_dir: &Path) -> Result<PathBuf, KernelError> {
    tokio::fs::create_dir_all(state_dir).await?;
    let path = state_dir.join(KERNEL_SCRIPT_NAME);
    tokio::fs::write(&path, KERNEL_SCRIPT).await?;
    Ok(path)
}

/// A fresh connection file path for one kernel start
pub fn connection_file_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(format!("kernel-{}-{}.json", name, Uuid::now_v7().simple()))
}

/// Spawn the kernel process with piped stdio
///
/// # Arguments
/// * `name` - Kernel name, passed through to the connection file
/// * `spec` - Interpreter and arguments
/// * `script` - Path of the installed kernel script
/// * `connection_file` - Where the kernel announces itself
/// * `workdir` - Working directory (the kernel workspace)
pub fn spawn_kernel(
    name: &str,
    spec: &KernelSpec,
    script: &Path,
    connection_file: &Path,
    workdir: &Path,
) -> Result<Child, KernelError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .arg(script)
        .arg("--connection-file")
        .arg(connection_file)
        .arg("--kernel-name")
        .arg(name)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(|source| KernelError::Spawn {
        name: name.to_string(),
        source,
    })
}

/// Forward the kernel's own stderr (not user output) to the log
pub fn forward_stderr(name: &str, stderr: ChildStderr) {
    let name = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(kernel = %name, "{}", line);
        }
    });
}

/// Wait until the connection file exists and parses
///
/// Polls with exponential backoff between `config.connect_backoff` and
/// `config.connect_backoff_max`, failing if the process exits or
/// `config.start_timeout` passes first.
pub async fn wait_for_connection_file(
    name: &str,
    path: &Path,
    child: &mut Child,
    config: &KernelConfig,
) -> Result<ConnectionInfo, KernelError> {
    let start = Instant::now();
    let mut delay = config.connect_backoff;

    loop {
        if let Some(info) = read_connection_file(path).await {
            debug!(kernel = name, pid = info.pid, waited_ms = start.elapsed().as_millis() as u64, "Kernel connection file ready");
            return Ok(info);
        }

        if let Some(status) = child.try_wait()? {
            return Err(KernelError::Exited {
                name: name.to_string(),
                status: status.to_string(),
            });
        }

        if start.elapsed() >= config.start_timeout {
            return Err(KernelError::StartTimeout {
                name: name.to_string(),
                waited: start.elapsed(),
            });
        }

        tokio::time::sleep(delay).await;
        delay = next_backoff(delay, config.connect_backoff_max);
    }
}

fn next_backoff(delay: Duration, max: Duration) -> Duration {
    (delay * 2).min(max)
}

/// The connection file, once it holds a complete JSON document
async fn read_connection_file(path: &Path) -> Option<ConnectionInfo> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_backoff_doubles_until_max() {
        let max = Duration::from_millis(300);
        assert_eq!(next_backoff(Duration::from_millis(50), max), Duration::from_millis(100));
        assert_eq!(next_backoff(Duration::from_millis(200), max), max);
    }

    #[test]
    fn test_connection_file_paths_are_unique() {
        let dir = Path::new("/tmp/state");
        let a = connection_file_path(dir, "python3");
        let b = connection_file_path(dir, "python3");
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("kernel-python3-"));
    }

    #[tokio::test]
    async fn test_install_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = install_script(dir.path()).await.unwrap();
        let source = std::fs::read_to_string(path).unwrap();
        assert!(source.contains("kernel_info_reply"));
    }

    #[tokio::test]
    async fn test_partial_connection_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conn.json");
        assert!(read_connection_file(&path).await.is_none());
        std::fs::write(&path, r#"{"kernel_name": "python3", "pi"#).unwrap();
        assert!(read_connection_file(&path).await.is_none());
        std::fs::write(&path, r#"{"kernel_name": "python3", "pid": 42}"#).unwrap();
        assert_eq!(read_connection_file(&path).await.map(|i| i.pid), Some(42));
    }

    #[tokio::test]
    async fn test_exited_process_fails_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exit 3")
            .spawn()
            .expect("sh should be available");
        let config = KernelConfig {
            start_timeout: Duration::from_secs(5),
            ..KernelConfig::default()
        };
        let result =
            wait_for_connection_file("python3", &dir.path().join("never.json"), &mut child, &config).await;
        assert!(matches!(result, Err(KernelError::Exited { .. })));
    }
}
