//! Prometheus metrics for agent runs and kernels
//!
//! All metrics live in the default registry; [`render`] produces the text
//! exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished agent runs.
    ///
    /// Labels:
    /// - backend: "openai", "grammar" or "mock"
    /// - outcome: "final_answer", "error", "cancelled"
    pub static ref AGENT_RUNS: CounterVec = register_counter_vec!(
        "codeloop_agent_runs_total",
        "Agent runs by backend and outcome",
        &["backend", "outcome"]
    ).expect("failed to register AGENT_RUNS metric");

    /// Loop iterations per run.
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "codeloop_agent_iterations",
        "Iterations per agent run",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    /// Time from request to end of one model response.
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "codeloop_model_call_duration_seconds",
        "Duration of one streamed model response",
        &["backend", "model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register MODEL_CALL_DURATION metric");

    /// Tokens counted against the run budgets.
    ///
    /// Labels:
    /// - direction: "input" or "output"
    pub static ref MODEL_TOKENS: CounterVec = register_counter_vec!(
        "codeloop_model_tokens_total",
        "Tokens consumed by model calls",
        &["backend", "direction"]
    ).expect("failed to register MODEL_TOKENS metric");

    /// Events emitted to clients.
    pub static ref AGENT_EVENTS: CounterVec = register_counter_vec!(
        "codeloop_agent_events_total",
        "Events emitted by kind",
        &["kind"]
    ).expect("failed to register AGENT_EVENTS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Kernel Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions.
    ///
    /// Labels:
    /// - language: "python", "bash", ...
    /// - status: "ok" or "error"
    pub static ref KERNEL_EXECUTIONS: CounterVec = register_counter_vec!(
        "codeloop_kernel_executions_total",
        "Code executions by language and status",
        &["language", "status"]
    ).expect("failed to register KERNEL_EXECUTIONS metric");

    pub static ref KERNEL_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "codeloop_kernel_execution_duration_seconds",
        "Wall time of one code execution",
        &["language"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).expect("failed to register KERNEL_EXECUTION_DURATION metric");

    /// Kernel start attempts.
    ///
    /// Labels:
    /// - status: "ok" or "error"
    pub static ref KERNEL_STARTS: CounterVec = register_counter_vec!(
        "codeloop_kernel_starts_total",
        "Kernel start attempts by kernel name and status",
        &["kernel", "status"]
    ).expect("failed to register KERNEL_STARTS metric");

    pub static ref KERNEL_START_DURATION: Histogram = register_histogram!(
        "codeloop_kernel_start_duration_seconds",
        "Time from spawn until a kernel answers kernel_info",
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).expect("failed to register KERNEL_START_DURATION metric");

    /// Kernels currently registered with the manager.
    pub static ref KERNELS_RUNNING: Gauge = register_gauge!(
        "codeloop_kernels_running",
        "Kernels currently running"
    ).expect("failed to register KERNELS_RUNNING metric");
}

/// Encode the default registry in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        AGENT_RUNS.with_label_values(&["mock", "final_answer"]).inc();
        KERNEL_EXECUTIONS.with_label_values(&["python", "ok"]).inc();
        let text = render();
        assert!(text.contains("codeloop_agent_runs_total"));
        assert!(text.contains("codeloop_kernel_executions_total"));
    }
}
