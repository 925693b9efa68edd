//! Kernel Handle - represents one live kernel with its I/O channels
//!
//! A handle is created by a [`KernelLauncher`](super::KernelLauncher) and
//! owned by the [`KernelRegistry`](super::KernelRegistry). The process (if
//! any) and its pump tasks live as long as the handle is registered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{Envelope, Submission};
use super::KernelError;

/// Buffer size of the submission and message channels
pub const CHANNEL_CAPACITY: usize = 256;

/// How long to wait for a killed process to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Host side of a kernel's channels
#[derive(Debug)]
pub struct KernelIo {
    input: mpsc::Sender<Submission>,
    messages: mpsc::Receiver<Envelope>,
}

/// Kernel side of a kernel's channels
#[derive(Debug)]
pub struct KernelEndpoint {
    pub submissions: mpsc::Receiver<Submission>,
    pub messages: mpsc::Sender<Envelope>,
}

/// Create a connected pair of host and kernel channel ends
pub fn kernel_channels() -> (KernelIo, KernelEndpoint) {
    let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        KernelIo {
            input: input_tx,
            messages: msg_rx,
        },
        KernelEndpoint {
            submissions: input_rx,
            messages: msg_tx,
        },
    )
}

impl KernelIo {
    /// Discard messages left over from earlier submissions
    pub fn drain_stale(&mut self) -> usize {
        let mut drained = 0;
        while self.messages.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Send a submission on the kernel's input channel
    pub async fn submit(&self, kernel_id: &str, submission: Submission) -> Result<(), KernelError> {
        self.input
            .send(submission)
            .await
            .map_err(|_| KernelError::InputClosed {
                kernel_id: kernel_id.to_string(),
            })
    }

    /// Receive the next message; `None` once the kernel has gone away
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.messages.recv().await
    }
}

/// A single live kernel
pub struct KernelHandle {
    /// Unique identifier for this kernel (e.g., "kernel-01926abc...")
    pub kernel_id: String,
    /// Project the kernel belongs to
    pub project_id: String,
    /// When this kernel was launched
    pub created_at: Instant,
    pid: Option<u32>,
    io: Mutex<KernelIo>,
    process: Mutex<Option<Child>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl KernelHandle {
    /// Create a handle around connected channels.
    ///
    /// `alive` is shared with whatever feeds the message channel; it must be
    /// cleared when the kernel goes away.
    pub fn new(
        kernel_id: impl Into<String>,
        project_id: impl Into<String>,
        io: KernelIo,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            project_id: project_id.into(),
            created_at: Instant::now(),
            pid: None,
            io: Mutex::new(io),
            process: Mutex::new(None),
            tasks: std::sync::Mutex::new(Vec::new()),
            alive,
        }
    }

    /// Attach the OS process backing this kernel
    pub fn with_process(mut self, child: Child) -> Self {
        self.pid = child.id();
        self.process = Mutex::new(Some(child));
        self
    }

    /// Attach background tasks to be aborted on shutdown
    pub fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        if let Ok(guard) = self.tasks.get_mut() {
            guard.extend(tasks);
        }
        self
    }

    /// OS process id, if the kernel is a real process
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the kernel is still able to accept work
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Time since the kernel was launched
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Exclusive access to the kernel's channels for one execution
    pub async fn lock_io(&self) -> MutexGuard<'_, KernelIo> {
        self.io.lock().await
    }

    /// Terminate the kernel: kill the process and stop its pump tasks
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(e) = child.start_kill() {
                // Process might already be dead
                debug!(kernel_id = %self.kernel_id, error = %e, "Kill failed");
            }
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(kernel_id = %self.kernel_id, %status, "Kernel process exited")
                }
                Ok(Err(e)) => warn!(kernel_id = %self.kernel_id, error = %e, "Failed to reap kernel"),
                Err(_) => warn!(kernel_id = %self.kernel_id, "Kernel process did not exit in time"),
            }
        }

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelHandle")
            .field("kernel_id", &self.kernel_id)
            .field("project_id", &self.project_id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("age", &self.age())
            .finish()
    }
}
