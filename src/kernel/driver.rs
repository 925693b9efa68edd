//! Execution Driver - runs one code fragment on a project's kernel
//!
//! The driver submits code, then pumps the kernel's message stream through a
//! [`MessagePump`] until it reaches a terminal state. Every receive is bounded
//! by the per-message timeout and races the caller's cancellation token.
//!
//! ```text
//!              stream / execute_result / display_data
//!                    ┌──────────┐
//!                    ▼          │
//!  submit ──► ┌─────────────┐───┘
//!             │  Receiving  │──── error ────► Errored
//!             └─────────────┘──── status=idle ► Idle
//!                    │
//!       timeout / cancelled / kernel exit ──► failure result (partial output kept)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::KernelHandle;
use super::protocol::{ExecutionState, KernelMessage, Submission};
use super::registry::KernelRegistry;
use super::KernelError;
use crate::metrics::{CODE_EXECUTIONS, CODE_EXECUTION_DURATION};

/// State of the message pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Waiting for further messages
    Receiving,
    /// The kernel reported an error (terminal)
    Errored,
    /// The kernel went idle (terminal)
    Idle,
}

/// Why an execution stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Idle,
    Errored,
    TimedOut,
    Cancelled,
    KernelExited,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::Idle => "idle",
            Termination::Errored => "errored",
            Termination::TimedOut => "timed_out",
            Termination::Cancelled => "cancelled",
            Termination::KernelExited => "kernel_exited",
        }
    }
}

/// Outcome of executing one code fragment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Output fragments in arrival order, joined by newlines
    pub output: String,
    /// Diagnostic text; set iff `success` is false
    pub error: Option<String>,
    pub termination: Termination,
    /// Wall time of the execution in milliseconds
    pub duration_ms: f64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            termination: Termination::Idle,
            duration_ms: 0.0,
        }
    }

    pub fn failure(
        output: impl Into<String>,
        error: impl Into<String>,
        termination: Termination,
    ) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            termination,
            duration_ms: 0.0,
        }
    }
}

/// Accumulates a kernel's messages for one submission
#[derive(Debug)]
pub struct MessagePump {
    state: PumpState,
    outputs: Vec<String>,
    error: Option<String>,
}

impl Default for MessagePump {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePump {
    pub fn new() -> Self {
        Self {
            state: PumpState::Receiving,
            outputs: Vec::new(),
            error: None,
        }
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    /// Apply one message. Messages after a terminal state are ignored.
    pub fn feed(&mut self, message: &KernelMessage) -> PumpState {
        if self.state != PumpState::Receiving {
            return self.state;
        }
        match message {
            KernelMessage::Error { .. } => {
                self.error = message.diagnostic();
                self.state = PumpState::Errored;
            }
            KernelMessage::Status(ExecutionState::Idle) => self.state = PumpState::Idle,
            KernelMessage::Status(_) => {}
            other => {
                if let Some(text) = other.output_text() {
                    self.outputs.push(text);
                }
            }
        }
        self.state
    }

    /// Output accumulated so far
    pub fn output(&self) -> String {
        self.outputs.join("\n")
    }

    /// Result for the pump's current state.
    ///
    /// Only meaningful once the pump is terminal; a pump still receiving is
    /// reported as interrupted with a kernel exit.
    pub fn finish(self) -> ExecutionResult {
        match self.state {
            PumpState::Idle => ExecutionResult::success(self.output()),
            PumpState::Errored => {
                let error = self.error.clone().unwrap_or_default();
                ExecutionResult::failure(self.output(), error, Termination::Errored)
            }
            PumpState::Receiving => self.interrupt(
                Termination::KernelExited,
                "Kernel stopped before execution finished",
            ),
        }
    }

    /// Stop before a terminal state, keeping partial output
    pub fn interrupt(self, termination: Termination, reason: impl Into<String>) -> ExecutionResult {
        ExecutionResult::failure(self.output(), reason, termination)
    }
}

/// Runs code fragments against project kernels
pub struct ExecutionDriver {
    registry: Arc<KernelRegistry>,
    message_timeout: Duration,
}

impl ExecutionDriver {
    /// Create a new driver
    ///
    /// # Arguments
    /// * `registry` - Registry owning the project kernels
    /// * `message_timeout` - Maximum wait for each kernel message
    pub fn new(registry: Arc<KernelRegistry>, message_timeout: Duration) -> Self {
        Self {
            registry,
            message_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<KernelRegistry> {
        &self.registry
    }

    /// Execute `code` in the project's kernel, creating the kernel if needed
    ///
    /// Only a kernel that cannot be started is an `Err`; timeouts, kernel
    /// errors, cancellation and kernel exits are failed results. The
    /// project's execution counter advances once per call that reached a
    /// kernel.
    pub async fn execute(
        &self,
        project_id: &str,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, KernelError> {
        let kernel = self.registry.get_or_create(project_id).await?;

        let start = Instant::now();
        let mut result = self.run_on(&kernel, code, cancel).await;
        result.duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let execution_count = self.registry.record_execution(project_id);

        let status = result.termination.as_str();
        CODE_EXECUTIONS.with_label_values(&[status]).inc();
        CODE_EXECUTION_DURATION
            .with_label_values(&[status])
            .observe(result.duration_ms / 1000.0);

        if result.success {
            info!(
                project_id,
                execution_count,
                duration_ms = result.duration_ms,
                "Execution finished"
            );
        } else {
            warn!(
                project_id,
                execution_count,
                termination = status,
                duration_ms = result.duration_ms,
                "Execution failed"
            );
        }

        Ok(result)
    }

    /// Submit `code` to `kernel` and pump messages until a terminal state
    pub async fn run_on(
        &self,
        kernel: &KernelHandle,
        code: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let mut io = kernel.lock_io().await;

        let stale = io.drain_stale();
        if stale > 0 {
            debug!(kernel_id = %kernel.kernel_id, stale, "Discarded stale kernel messages");
        }

        let submission = Submission::new(code);
        let msg_id = submission.msg_id.clone();
        if let Err(e) = io.submit(&kernel.kernel_id, submission).await {
            return ExecutionResult::failure(String::new(), e.to_string(), Termination::KernelExited);
        }

        let mut pump = MessagePump::new();
        // Only messages for this submission push the deadline back
        let mut deadline = tokio::time::Instant::now() + self.message_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return pump.interrupt(Termination::Cancelled, "Execution cancelled");
                }
                _ = tokio::time::sleep_until(deadline) => None,
                received = io.recv() => Some(received),
            };

            match next {
                None => {
                    return pump.interrupt(
                        Termination::TimedOut,
                        format!(
                            "Execution timed out: no kernel message within {:?}",
                            self.message_timeout
                        ),
                    );
                }
                Some(None) => {
                    return pump.interrupt(
                        Termination::KernelExited,
                        "Kernel process exited during execution",
                    );
                }
                Some(Some(envelope)) => {
                    if envelope.parent_id.as_deref() != Some(msg_id.as_str()) {
                        debug!(
                            kernel_id = %kernel.kernel_id,
                            parent_id = ?envelope.parent_id,
                            "Ignoring message for another submission"
                        );
                        continue;
                    }
                    deadline = tokio::time::Instant::now() + self.message_timeout;
                    if pump.feed(&envelope.message) != PumpState::Receiving {
                        return pump.finish();
                    }
                }
            }
        }
    }
}
