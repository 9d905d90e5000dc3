//! Kernel process tests against a real `python3`
//!
//! Each test returns early when no `python3` is on the PATH.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use codeloop::agent::{Agent, AgentEngine, MockBackend, SessionRegistry};
use codeloop::config::{AgentConfig, KernelConfig, WorkspaceConfig};
use codeloop::kernel::{CodeKernel, ExecuteRequest, ExecuteResponse, KernelManager, StopStatus};

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn manager(dir: &Path) -> KernelManager {
    let config = KernelConfig {
        state_dir: dir.join("state"),
        start_timeout: Duration::from_secs(20),
        ..KernelConfig::default()
    };
    let workspace = WorkspaceConfig {
        root: dir.join("workspace"),
        ..WorkspaceConfig::default()
    };
    KernelManager::new(config, &workspace)
}

/// Connection files currently in the state directory
fn connection_files(state_dir: &Path) -> usize {
    std::fs::read_dir(state_dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with("kernel-"))
                .count()
        })
        .unwrap_or(0)
}

async fn run(kernel: &dyn CodeKernel, code: &str, language: &str) -> Vec<ExecuteResponse> {
    let stream = kernel
        .execute(ExecuteRequest::new(code, language))
        .await
        .unwrap();
    stream.map(|r| r.unwrap()).collect().await
}

fn stdout(responses: &[ExecuteResponse]) -> String {
    responses
        .iter()
        .filter_map(|r| match r {
            ExecuteResponse::Stdout(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_python_kernel_lifecycle() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());

    // Concurrent starts share one process
    let (kernel, again) = tokio::join!(manager.start("python3"), manager.start("python3"));
    let (kernel, again) = (kernel.unwrap(), again.unwrap());
    assert!(kernel.is_alive());
    assert!(Arc::ptr_eq(&kernel, &again));
    assert_eq!(kernel.info().pid, again.info().pid);
    assert_eq!(manager.names().await, vec!["python3".to_string()]);
    assert_eq!(connection_files(&dir.path().join("state")), 1);

    // A later start reuses it
    let later = manager.start("python3").await.unwrap();
    assert_eq!(later.info().pid, kernel.info().pid);

    let out = run(kernel.as_ref(), "print('hello world!')", "python").await;
    assert_eq!(stdout(&out), "hello world!\n");

    // Namespace persists between executions
    run(kernel.as_ref(), "x = 41", "python").await;
    let out = run(kernel.as_ref(), "x + 1", "python").await;
    assert!(out.iter().any(|r| matches!(r, ExecuteResponse::Result(data) if data.get("text/plain").map(String::as_str) == Some("42"))));

    // Image output lands in the kernel workspace
    let out = run(
        kernel.as_ref(),
        "class Img:\n    def _repr_png_(self):\n        return b'\\x89PNG'\ndisplay(Img())",
        "python",
    )
    .await;
    let image = out
        .iter()
        .find_map(|r| match r {
            ExecuteResponse::Result(data) => data.get("image/png").cloned(),
            _ => None,
        })
        .expect("no image output");
    let stored = std::fs::read(dir.path().join("workspace").join("python3").join(&image)).unwrap();
    assert_eq!(stored, b"\x89PNG");

    let out = run(kernel.as_ref(), "echo from bash", "bash").await;
    assert_eq!(stdout(&out), "from bash\n");

    assert_eq!(manager.stop("python3").await, StopStatus::Stopped);
    assert_eq!(manager.stop("python3").await, StopStatus::NoKernel);
    assert_eq!(connection_files(&dir.path().join("state")), 0);
}

/// Concurrent binds for one key start one kernel and build one agent
#[tokio::test]
async fn test_concurrent_bind_shares_session() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let registry = SessionRegistry::new();
    let agents = AtomicUsize::new(0);
    let make_agent = |kernel: Arc<dyn CodeKernel>| -> Arc<dyn Agent> {
        agents.fetch_add(1, Ordering::SeqCst);
        Arc::new(AgentEngine::new(MockBackend::hello_world(), kernel, AgentConfig::default()))
    };

    let (first, second) = tokio::join!(
        registry.bind("key", &manager, "python3", make_agent),
        registry.bind("key", &manager, "python3", make_agent),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(agents.load(Ordering::SeqCst), 1);
    assert_eq!(registry.len().await, 1);
    assert_eq!(connection_files(&dir.path().join("state")), 1);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn test_python_traceback() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path());
    let kernel = manager.start("python3").await.unwrap();

    let out = run(kernel.as_ref(), "def f(n):\n    return f(n + 1) if n < 30 else 1 / 0\nf(0)", "python").await;
    let traceback = out
        .iter()
        .find_map(|r| match r {
            ExecuteResponse::Traceback(text) => Some(text.clone()),
            _ => None,
        })
        .expect("no traceback");
    assert!(traceback.contains("ZeroDivisionError"));
    assert!(traceback.lines().count() <= 6);

    // The kernel survives the error
    let out = run(kernel.as_ref(), "print(2)", "python").await;
    assert_eq!(stdout(&out), "2\n");

    manager.shutdown_all().await;
}
