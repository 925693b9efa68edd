//! Kernel launching
//!
//! Spawns kernel processes, wires their stdio into the message protocol and
//! waits for the readiness handshake (an initial `status: idle` with no
//! parent) before handing the kernel to the registry.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::{kernel_channels, KernelHandle};
use super::protocol::{decode_line, ExecutionState, KernelMessage};
use super::{KernelConfig, KernelError};
use crate::metrics::KERNEL_SPAWNS;

/// Creates kernels on behalf of the registry
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    /// Start a kernel for `project_id` and return it once it is ready
    async fn launch(&self, project_id: &str) -> Result<KernelHandle, KernelError>;
}

/// Launches kernels as child processes speaking the stdio protocol
pub struct ProcessLauncher {
    config: KernelConfig,
}

impl ProcessLauncher {
    pub fn new(config: KernelConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl KernelLauncher for ProcessLauncher {
    async fn launch(&self, project_id: &str) -> Result<KernelHandle, KernelError> {
        let kernel_id = format!("kernel-{}", Uuid::now_v7());
        let unavailable = |reason: String| KernelError::Unavailable {
            project_id: project_id.to_string(),
            reason,
        };

        info!(%kernel_id, project_id, program = %self.config.program, "Launching kernel");

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .env("LABKERNEL_PROJECT_ID", project_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            KERNEL_SPAWNS.with_label_values(&["spawn_failed"]).inc();
            unavailable(format!("failed to spawn '{}': {}", self.config.program, e))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            KERNEL_SPAWNS.with_label_values(&["spawn_failed"]).inc();
            return Err(unavailable("kernel stdio was not captured".to_string()));
        };

        let (io, endpoint) = kernel_channels();
        let alive = Arc::new(AtomicBool::new(true));

        let mut submissions = endpoint.submissions;
        let writer_id = kernel_id.clone();
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(submission) = submissions.recv().await {
                let line = match submission.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(kernel_id = %writer_id, error = %e, "Failed to encode submission");
                        continue;
                    }
                };
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(kernel_id = %writer_id, error = %e, "Kernel stdin closed");
                    break;
                }
            }
        });

        let messages = endpoint.messages;
        let reader_alive = Arc::clone(&alive);
        let reader_id = kernel_id.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_line(&line) {
                        Ok(Some(envelope)) => {
                            if messages.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(kernel_id = %reader_id, error = %e, line = %line, "Skipping kernel output")
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(kernel_id = %reader_id, error = %e, "Failed to read kernel stdout");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
            debug!(kernel_id = %reader_id, "Kernel output closed");
        });

        let stderr_id = kernel_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(kernel_id = %stderr_id, "[kernel stderr] {}", line);
            }
        });

        let handle = KernelHandle::new(kernel_id.clone(), project_id, io, alive)
            .with_process(child)
            .with_tasks(vec![writer, reader, stderr_task]);

        if let Err(reason) = wait_for_ready(&handle, self.config.startup_timeout).await {
            KERNEL_SPAWNS.with_label_values(&["handshake_failed"]).inc();
            handle.shutdown().await;
            return Err(unavailable(reason));
        }

        KERNEL_SPAWNS.with_label_values(&["success"]).inc();
        info!(%kernel_id, project_id, pid = ?handle.pid(), "Kernel ready");
        Ok(handle)
    }
}

/// Wait for the kernel's startup `status: idle`
///
/// # Returns
/// Ok(()) once the kernel reports idle, Err with a reason on timeout or exit
pub async fn wait_for_ready(handle: &KernelHandle, timeout: Duration) -> Result<(), String> {
    let mut io = handle.lock_io().await;
    let ready = async {
        loop {
            match io.recv().await {
                Some(envelope) => {
                    if envelope.parent_id.is_none()
                        && envelope.message == KernelMessage::Status(ExecutionState::Idle)
                    {
                        return Ok(());
                    }
                }
                None => return Err("kernel exited during startup".to_string()),
            }
        }
    };

    match tokio::time::timeout(timeout, ready).await {
        Ok(result) => result,
        Err(_) => Err(format!("kernel not ready after {:?}", timeout)),
    }
}

/// Default kernel program: a persistent Python interpreter loop.
///
/// Reads one submission per stdin line, executes it in a namespace that
/// persists for the life of the process, and reports stdout/stderr line by
/// line, the value of a trailing expression, exceptions and run state.
/// Executed code sees an empty stdin.
pub const PYTHON_BOOTSTRAP: &str = r##"
import ast, io, json, sys, traceback

_out = sys.stdout
_in = sys.stdin
_ns = {"__name__": "__main__"}

def _emit(parent, msg_type, content):
    _out.write(json.dumps({"parent_id": parent, "msg_type": msg_type, "content": content}) + "\n")
    _out.flush()

class _Stream(io.TextIOBase):
    def __init__(self, parent, name):
        self._parent = parent
        self._name = name
        self._buf = []
    def writable(self):
        return True
    def write(self, s):
        self._buf.append(s)
        if "\n" in s:
            text = "".join(self._buf)
            cut = text.rfind("\n") + 1
            self._buf = [text[cut:]]
            _emit(self._parent, "stream", {"name": self._name, "text": text[:cut]})
        return len(s)
    def flush(self):
        text = "".join(self._buf)
        self._buf = []
        if text:
            _emit(self._parent, "stream", {"name": self._name, "text": text})

def _run(parent, code):
    out = _Stream(parent, "stdout")
    err = _Stream(parent, "stderr")
    sys.stdout, sys.stderr = out, err
    sys.stdin = io.StringIO()
    try:
        tree = ast.parse(code, "<cell>", "exec")
        last = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            last = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<cell>", "exec"), _ns)
        if last is not None:
            value = eval(compile(last, "<cell>", "eval"), _ns)
            out.flush()
            if value is not None:
                _emit(parent, "execute_result", {"data": {"text/plain": repr(value)}})
    finally:
        out.flush()
        err.flush()
        sys.stdout, sys.stderr, sys.stdin = _out, sys.__stderr__, _in

_emit(None, "status", {"execution_state": "idle"})
for _line in _in:
    if not _line.strip():
        continue
    try:
        _req = json.loads(_line)
    except ValueError:
        continue
    _pid = _req.get("msg_id")
    _emit(_pid, "status", {"execution_state": "busy"})
    try:
        _run(_pid, _req.get("code", ""))
    except BaseException as _e:
        _tb = [l.rstrip("\n") for l in traceback.format_exception(type(_e), _e, _e.__traceback__)]
        _emit(_pid, "error", {"ename": type(_e).__name__, "evalue": str(_e), "traceback": _tb})
    _emit(_pid, "status", {"execution_state": "idle"})
"##;
