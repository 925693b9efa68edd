//! Kernel management module
//!
//! This module owns the long-lived execution processes ("kernels") that back
//! each project:
//! - Wire protocol between host and kernel
//! - Kernel launching and the readiness handshake
//! - Registry of live kernels keyed by project id
//! - Execution driver pumping a kernel's message stream
//!
//! # Architecture
//!
//! ```text
//! ExecutionDriver.execute(project, code)
//!        │
//!        ▼
//! KernelRegistry.get_or_create(project) ──(absent)──► KernelLauncher.launch()
//!        │                                                   │
//!        │◄──────────────── KernelHandle ◄───────────────────┘
//!        ▼
//! submit code ──► stdin │ kernel │ stdout ──► KernelMessage stream
//!                                                   │
//!        MessagePump {Receiving → Idle | Errored} ◄─┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

pub mod driver;
pub mod handle;
pub mod launcher;
pub mod protocol;
pub mod registry;

pub use driver::{ExecutionDriver, ExecutionResult, MessagePump, PumpState, Termination};
pub use handle::{kernel_channels, KernelEndpoint, KernelHandle, KernelIo};
pub use launcher::{KernelLauncher, ProcessLauncher, PYTHON_BOOTSTRAP};
pub use protocol::{Envelope, ExecutionState, KernelMessage, Submission};
pub use registry::{KernelRegistry, RegistryStats};

/// Configuration for kernel processes and execution
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Kernel executable (e.g., "python3")
    pub program: String,
    /// Arguments passed to the kernel executable
    pub args: Vec<String>,
    /// Working directory for kernel processes (inherits when None)
    pub working_dir: Option<PathBuf>,
    /// Maximum wait for the readiness handshake
    pub startup_timeout: Duration,
    /// Maximum wait for each individual kernel message during execution
    pub message_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "-u".to_string(),
                "-c".to_string(),
                PYTHON_BOOTSTRAP.to_string(),
            ],
            working_dir: None,
            startup_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(20),
        }
    }
}

/// Error type for kernel operations
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The kernel process could not be started or did not become ready
    #[error("kernel unavailable for project {project_id}: {reason}")]
    Unavailable { project_id: String, reason: String },
    /// The kernel stopped accepting submissions
    #[error("kernel {kernel_id} input channel closed")]
    InputClosed { kernel_id: String },
}
