//! Prometheus metrics for the orchestrator
//!
//! All metrics live in the default registry; [`gather_text`] renders them in
//! the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Kernel Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Kernel process launches.
    ///
    /// Labels:
    /// - status: "success", "spawn_failed" or "handshake_failed"
    pub static ref KERNEL_SPAWNS: CounterVec = register_counter_vec!(
        "labkernel_kernel_spawns_total",
        "Kernel process launches by outcome",
        &["status"]
    ).expect("failed to register KERNEL_SPAWNS metric");

    /// Kernels currently held by the registry.
    pub static ref KERNELS_LIVE: Gauge = register_gauge!(
        "labkernel_kernels_live",
        "Kernel processes currently held by the registry"
    ).expect("failed to register KERNELS_LIVE metric");

    /// Code executions by how the receive loop ended.
    ///
    /// Labels:
    /// - termination: "idle", "errored", "timed_out", "cancelled" or "kernel_exited"
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "labkernel_code_executions_total",
        "Code executions by termination",
        &["termination"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    /// Wall-clock time of a single execution, in seconds.
    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "labkernel_code_execution_duration_seconds",
        "Code execution duration by termination",
        &["termination"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 60.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Conversation Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Chat provider call latency, in seconds.
    ///
    /// Labels:
    /// - model: model name sent to the provider
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "labkernel_llm_call_duration_seconds",
        "Chat provider call duration",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Conversation turns by outcome.
    ///
    /// Labels:
    /// - outcome: "completed", "inconclusive", "cancelled" or "error"
    pub static ref AGENT_TURNS: CounterVec = register_counter_vec!(
        "labkernel_agent_turns_total",
        "Conversation turns by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_TURNS metric");

    /// Execution rounds needed per finished turn.
    pub static ref AGENT_ROUNDS: Histogram = register_histogram!(
        "labkernel_agent_rounds",
        "Execution rounds per conversation turn",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 10.0, 15.0, 20.0]
    ).expect("failed to register AGENT_ROUNDS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Transcript Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Transcript appends.
    ///
    /// Labels:
    /// - status: "ok", "archived" (a corrupt file was moved aside) or "error"
    pub static ref TRANSCRIPT_APPENDS: CounterVec = register_counter_vec!(
        "labkernel_transcript_appends_total",
        "Transcript appends by status",
        &["status"]
    ).expect("failed to register TRANSCRIPT_APPENDS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    // Touch the plain gauge so it is exported before the first kernel starts
    KERNELS_LIVE.add(0.0);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
