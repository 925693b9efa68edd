//! labkernel - stateful kernel orchestrator for LLM code-execution loops
//!
//! A model reply containing fenced Python blocks is executed in a long-lived
//! per-project kernel; the results go back to the model until it answers
//! without code or the round cap is reached. Every executed block is recorded
//! in an append-only per-project transcript.
//!
//! # Modules
//!
//! - `kernel` - Kernel processes, registry and execution driver
//! - `transcript` - Append-only per-project transcript documents
//! - `llm` - Chat provider seam and the Ollama client
//! - `agent` - Code extraction, the conversation loop and project sessions
//! - `config` - Settings with environment overrides
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use labkernel::{ExecutionDriver, KernelRegistry, ProcessLauncher};
//!
//! let registry = Arc::new(KernelRegistry::new(Arc::new(ProcessLauncher::new(config))));
//! let driver = ExecutionDriver::new(registry, Duration::from_secs(20));
//! let result = driver.execute("proj-1", "x = 41\nx + 1", &CancellationToken::new()).await?;
//! assert_eq!(result.output, "42");
//! ```

pub mod agent;
pub mod config;
pub mod kernel;
pub mod llm;
pub mod metrics;
pub mod tracing;
pub mod transcript;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentError, ConversationController, SessionManager, TurnOutcome, TurnResult};
pub use config::Settings;
pub use kernel::{ExecutionDriver, ExecutionResult, KernelConfig, KernelRegistry, ProcessLauncher};
pub use transcript::{CorruptPolicy, TranscriptStore};
