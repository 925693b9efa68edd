//! In-process stand-ins for the kernel process and the chat provider.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests in `tests/`.
//!
//! The fake kernel understands a tiny line-oriented language:
//!
//! | line              | effect                                         |
//! |-------------------|------------------------------------------------|
//! | `name = value`    | bind `value` (literal or another name)         |
//! | `print(expr)`     | stream `expr` followed by a newline            |
//! | `display(expr)`   | `display_data` with a `text/plain` rendering   |
//! | `raise Name`      | error `Name`; `raise Name("msg")` sets evalue  |
//! | `sleep <ms>`      | pause before the next line                     |
//! | `hang`            | stop without ever reporting idle               |
//! | `exit`            | the kernel terminates                          |
//! | `expr` (last line)| `execute_result` with the value                |

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::kernel::protocol::{Envelope, ExecutionState, KernelMessage, TEXT_PLAIN};
use crate::kernel::{kernel_channels, KernelError, KernelHandle, KernelLauncher};
use crate::llm::{ChatError, ChatMessage, ChatProvider};

/// Launcher for in-process fake kernels
#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    failing: AtomicBool,
}

impl FakeLauncher {
    /// Number of kernels launched so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make subsequent launches fail with `KernelError::Unavailable`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl KernelLauncher for FakeLauncher {
    async fn launch(&self, project_id: &str) -> Result<KernelHandle, KernelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(KernelError::Unavailable {
                project_id: project_id.to_string(),
                reason: "fake launcher set to fail".to_string(),
            });
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);

        let (io, endpoint) = kernel_channels();
        let alive = Arc::new(AtomicBool::new(true));
        let kernel_alive = Arc::clone(&alive);

        let task = tokio::spawn(async move {
            let mut submissions = endpoint.submissions;
            let messages = endpoint.messages;
            let mut kernel = FakeKernel::default();
            while let Some(submission) = submissions.recv().await {
                let parent = Some(submission.msg_id.clone());
                let send = |message: KernelMessage| {
                    let messages = messages.clone();
                    let parent_id = parent.clone();
                    async move {
                        let _ = messages.send(Envelope { parent_id, message }).await;
                    }
                };

                send(KernelMessage::Status(ExecutionState::Busy)).await;
                match kernel.run(&submission.code, &send).await {
                    Step::Done => send(KernelMessage::Status(ExecutionState::Idle)).await,
                    Step::Hang => {}
                    Step::Exit => break,
                }
            }
            kernel_alive.store(false, Ordering::SeqCst);
        });

        Ok(KernelHandle::new(format!("fake-kernel-{}", n), project_id, io, alive).with_tasks(vec![task]))
    }
}

enum Step {
    Done,
    Hang,
    Exit,
}

#[derive(Default)]
struct FakeKernel {
    namespace: HashMap<String, String>,
}

impl FakeKernel {
    async fn run<F, Fut>(&mut self, code: &str, send: &F) -> Step
    where
        F: Fn(KernelMessage) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let lines: Vec<&str> = code
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        for (i, line) in lines.iter().enumerate() {
            let is_last = i + 1 == lines.len();

            if *line == "hang" {
                return Step::Hang;
            }
            if *line == "exit" {
                return Step::Exit;
            }
            if let Some(ms) = line.strip_prefix("sleep ") {
                let ms = ms.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                continue;
            }
            if let Some(rest) = line.strip_prefix("raise ") {
                let (ename, evalue) = match rest.split_once('(') {
                    Some((name, arg)) => (
                        name.trim().to_string(),
                        unquote(arg.trim_end_matches(')')).to_string(),
                    ),
                    None => (rest.trim().to_string(), String::new()),
                };
                send(error(&ename, &evalue)).await;
                return Step::Done;
            }
            if let Some(arg) = call_arg(line, "print") {
                match self.eval(arg) {
                    Ok(value) => {
                        send(KernelMessage::Stream {
                            name: "stdout".into(),
                            text: format!("{}\n", value),
                        })
                        .await
                    }
                    Err(e) => {
                        send(e).await;
                        return Step::Done;
                    }
                }
                continue;
            }
            if let Some(arg) = call_arg(line, "display") {
                match self.eval(arg) {
                    Ok(value) => send(KernelMessage::DisplayData {
                        data: [(TEXT_PLAIN.to_string(), serde_json::Value::String(value))].into(),
                    })
                    .await,
                    Err(e) => {
                        send(e).await;
                        return Step::Done;
                    }
                }
                continue;
            }
            if let Some((name, expr)) = line.split_once('=') {
                match self.eval(expr.trim()) {
                    Ok(value) => {
                        self.namespace.insert(name.trim().to_string(), value);
                    }
                    Err(e) => {
                        send(e).await;
                        return Step::Done;
                    }
                }
                continue;
            }
            if is_last {
                match self.eval(line) {
                    Ok(value) => {
                        send(KernelMessage::ExecuteResult {
                            data: [(TEXT_PLAIN.to_string(), serde_json::Value::String(value))]
                                .into(),
                        })
                        .await
                    }
                    Err(e) => {
                        send(e).await;
                        return Step::Done;
                    }
                }
            }
        }
        Step::Done
    }

    fn eval(&self, expr: &str) -> Result<String, KernelMessage> {
        let expr = expr.trim();
        if expr.parse::<i64>().is_ok() {
            return Ok(expr.to_string());
        }
        if expr.len() >= 2
            && ((expr.starts_with('"') && expr.ends_with('"'))
                || (expr.starts_with('\'') && expr.ends_with('\'')))
        {
            return Ok(unquote(expr).to_string());
        }
        if expr.starts_with('{') || expr.starts_with('[') {
            return Ok(expr.to_string());
        }
        self.namespace.get(expr).cloned().ok_or_else(|| {
            error("NameError", &format!("name '{}' is not defined", expr))
        })
    }
}

fn call_arg<'a>(line: &'a str, func: &str) -> Option<&'a str> {
    line.strip_prefix(func)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn unquote(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

fn error(ename: &str, evalue: &str) -> KernelMessage {
    KernelMessage::Error {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback: vec![
            "Traceback (most recent call last):".to_string(),
            format!("{}: {}", ename, evalue),
        ],
    }
}

/// Chat provider replaying scripted replies and recording every request
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    /// Reply with `replies` in order; further calls fail with `EmptyResponse`
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `reply` on every call
    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a provider failure after the scripted replies
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        if let Ok(replies) = self.replies.get_mut() {
            replies.push_back(Err(message.into()));
        }
        self
    }

    /// Number of provider calls made
    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Conversation passed on each call
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let next = self.replies.lock().ok().and_then(|mut r| r.pop_front());
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(ChatError::Provider(message)),
            None => self.fallback.clone().ok_or(ChatError::EmptyResponse),
        }
    }
}
