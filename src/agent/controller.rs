//! Conversation Loop Controller - the bounded execute-and-feed-back loop
//!
//! One user turn runs as a sequence of rounds. Each round calls the chat
//! provider, extracts code blocks from the reply, runs them in order on the
//! project's kernel, records them in the transcript and sends the combined
//! results back as the next user message. The turn ends when a reply has no
//! code, or as `Inconclusive` when the round cap is reached.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::extract::{CodeBlock, CodeExtractor, DEFAULT_LANGUAGES};
use crate::kernel::{ExecutionDriver, ExecutionResult, KernelError};
use crate::llm::{ChatError, ChatMessage, ChatProvider};
use crate::metrics::{AGENT_ROUNDS, AGENT_TURNS, LLM_CALL_DURATION};
use crate::transcript::TranscriptStore;

/// Marker line opening every follow-up message
pub const BLOCK_RESPONSE_MARKER: &str = "BLOCK_RESPONSE";

/// Shown for a successful block that printed nothing
pub const NO_OUTPUT_MARKER: &str = "(Code executed successfully with no output)";

/// Separator between per-block results in a follow-up message
pub const BLOCK_DIVIDER: &str = "\n\n---\n\n";

const FOLLOW_UP_INTRO: &str = "Here are the results of executing your code:";
const FOLLOW_UP_OUTRO: &str = "Perform the next step of your analysis based on these results, \
or provide your final answer if the analysis is complete.";

/// Configuration for the conversation loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model name, used for metrics and logs
    pub model: String,
    /// Maximum execution rounds per user turn
    pub max_rounds: usize,
    /// Custom system prompt (uses the prompt file or the default if None)
    pub system_prompt: Option<String>,
    /// When false, replies are returned as-is and no code is run
    pub enable_execution: bool,
    /// Fence tags treated as executable code
    pub languages: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "qwen3".to_string(),
            max_rounds: 10,
            system_prompt: None,
            enable_execution: true,
            languages: DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect(),
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a reply without code
    Completed,
    /// The round cap was reached while the model still wanted to run code
    Inconclusive,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Completed => "completed",
            TurnOutcome::Inconclusive => "inconclusive",
        }
    }
}

/// Record of a single code execution within a turn
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Round the block was executed in, from 1
    pub round: usize,
    /// Position of the block within its reply, from 0
    pub block_index: usize,
    /// Code that was executed
    pub code: String,
    pub result: ExecutionResult,
}

/// Result of one user turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub outcome: TurnOutcome,
    /// The last assistant reply
    pub final_response: String,
    /// Execution rounds completed
    pub rounds: usize,
    /// Number of chat provider calls made
    pub provider_calls: usize,
    /// Every execution in order
    pub executions: Vec<ExecutionRecord>,
    /// Unique trace ID for this turn
    pub trace_id: String,
}

/// Error type for agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The chat provider failed; the turn is aborted
    #[error("{0}")]
    Provider(#[from] ChatError),
    /// The project's kernel could not be started
    #[error(transparent)]
    KernelUnavailable(#[from] KernelError),
    /// The caller cancelled the turn
    #[error("turn cancelled")]
    Cancelled,
    /// No conversation exists for the project
    #[error("unknown project: {0}")]
    UnknownProject(String),
}

/// Drives the extract, execute, feed back loop for a project
pub struct ConversationController {
    provider: Arc<dyn ChatProvider>,
    driver: Arc<ExecutionDriver>,
    transcripts: Arc<TranscriptStore>,
    extractor: CodeExtractor,
    config: AgentConfig,
}

impl ConversationController {
    /// Create a new controller
    ///
    /// # Arguments
    /// * `provider` - Chat provider for LLM interactions
    /// * `driver` - Execution driver backed by the kernel registry
    /// * `transcripts` - Transcript store recording executed code
    /// * `config` - Loop configuration
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        driver: Arc<ExecutionDriver>,
        transcripts: Arc<TranscriptStore>,
        config: AgentConfig,
    ) -> Result<Self, regex::Error> {
        let extractor = CodeExtractor::new(&config.languages)?;
        Ok(Self {
            provider,
            driver,
            transcripts,
            extractor,
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<ExecutionDriver> {
        &self.driver
    }

    pub fn transcripts(&self) -> &Arc<TranscriptStore> {
        &self.transcripts
    }

    /// Run one user turn
    ///
    /// `messages` is the conversation so far, ending with the user's message.
    /// Assistant replies and follow-up messages are appended to it in place.
    pub async fn run_turn(
        &self,
        project_id: &str,
        messages: &mut Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            project_id = %project_id,
            model = %self.config.model,
            otel.name = "agent_turn"
        );

        let result = self
            .turn_loop(project_id, messages, cancel, &trace_id)
            .instrument(root_span)
            .await;

        match &result {
            Ok(turn) => {
                AGENT_TURNS.with_label_values(&[turn.outcome.as_str()]).inc();
                AGENT_ROUNDS.observe(turn.rounds as f64);
            }
            Err(AgentError::Cancelled) => {
                AGENT_TURNS.with_label_values(&["cancelled"]).inc();
            }
            Err(_) => {
                AGENT_TURNS.with_label_values(&["error"]).inc();
            }
        }
        result
    }

    async fn turn_loop(
        &self,
        project_id: &str,
        messages: &mut Vec<ChatMessage>,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<TurnResult, AgentError> {
        info!(trace_id = %trace_id, project_id, "Starting turn");

        let mut rounds = 0;
        let mut provider_calls = 0;
        let mut executions = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            provider_calls += 1;
            let reply = self.call_provider(messages, cancel, trace_id, provider_calls).await?;
            messages.push(ChatMessage::assistant(reply.clone()));

            let blocks = if self.config.enable_execution {
                self.extractor.extract_code_blocks(&reply)
            } else {
                Vec::new()
            };

            if blocks.is_empty() {
                info!(trace_id = %trace_id, rounds, provider_calls, "Turn completed");
                return Ok(TurnResult {
                    outcome: TurnOutcome::Completed,
                    final_response: reply,
                    rounds,
                    provider_calls,
                    executions,
                    trace_id: trace_id.to_string(),
                });
            }

            if rounds >= self.config.max_rounds {
                warn!(
                    trace_id = %trace_id,
                    rounds,
                    pending_blocks = blocks.len(),
                    "Round cap reached, turn is inconclusive"
                );
                return Ok(TurnResult {
                    outcome: TurnOutcome::Inconclusive,
                    final_response: reply,
                    rounds,
                    provider_calls,
                    executions,
                    trace_id: trace_id.to_string(),
                });
            }

            rounds += 1;
            let mut block_results = Vec::with_capacity(blocks.len());
            for block in &blocks {
                let result = self
                    .execute_block(project_id, block, rounds, cancel, trace_id)
                    .await?;
                block_results.push(format_block_result(block.index, &result));
                executions.push(ExecutionRecord {
                    round: rounds,
                    block_index: block.index,
                    code: block.source.clone(),
                    result,
                });
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }
            }

            messages.push(ChatMessage::user(format_follow_up(&block_results)));
        }
    }

    async fn call_provider(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
        trace_id: &str,
        call: usize,
    ) -> Result<String, AgentError> {
        let llm_span = info_span!(
            "llm_call",
            trace_id = %trace_id,
            call,
            model = %self.config.model,
            otel.name = "llm_call"
        );

        let start = Instant::now();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            reply = self.provider.complete(messages).instrument(llm_span) => reply,
        };
        let duration_secs = start.elapsed().as_secs_f64();
        LLM_CALL_DURATION
            .with_label_values(&[&self.config.model])
            .observe(duration_secs);

        match reply {
            Ok(text) => {
                debug!(trace_id = %trace_id, call, duration_secs, reply_len = text.len(), "LLM call completed");
                Ok(text)
            }
            Err(e) => {
                warn!(trace_id = %trace_id, call, error = %e, "LLM call failed");
                Err(AgentError::Provider(e))
            }
        }
    }

    async fn execute_block(
        &self,
        project_id: &str,
        block: &CodeBlock,
        round: usize,
        cancel: &CancellationToken,
        trace_id: &str,
    ) -> Result<ExecutionResult, AgentError> {
        let exec_span = info_span!(
            "code_execution",
            trace_id = %trace_id,
            round,
            block = block.index,
            code_len = block.source.len(),
            otel.name = "code_execution"
        );

        async {
            let result = self.driver.execute(project_id, &block.source, cancel).await?;

            if let Err(e) = self
                .transcripts
                .append(project_id, &block.source, &result.output, result.error.as_deref())
                .await
            {
                warn!(trace_id = %trace_id, project_id, error = %e, "Failed to record execution in transcript");
            }
            Ok(result)
        }
        .instrument(exec_span)
        .await
    }
}

/// Render one block's result for the follow-up message; `index` is 0-based
pub fn format_block_result(index: usize, result: &ExecutionResult) -> String {
    let mut text = format!("Code Block {} Execution Results:\n", index + 1);
    if result.success {
        if result.output.trim().is_empty() {
            text.push_str(NO_OUTPUT_MARKER);
        } else {
            text.push_str(&result.output);
        }
    } else {
        text.push_str("Execution Error:\n");
        text.push_str(result.error.as_deref().unwrap_or_default());
    }
    text
}

/// Build the follow-up user message from rendered block results
pub fn format_follow_up(block_results: &[String]) -> String {
    format!(
        "{}\n\n\n{}\n\n\n{}\n\n{}",
        BLOCK_RESPONSE_MARKER,
        FOLLOW_UP_INTRO,
        block_results.join(BLOCK_DIVIDER),
        FOLLOW_UP_OUTRO
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelRegistry, Termination};
    use crate::test_support::{FakeLauncher, ScriptedProvider};
    use crate::transcript::CorruptPolicy;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        provider: Arc<ScriptedProvider>,
        controller: ConversationController,
    }

    fn fixture(provider: ScriptedProvider, config: AgentConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let registry = Arc::new(KernelRegistry::new(launcher.clone()));
        let driver = Arc::new(ExecutionDriver::new(registry, Duration::from_millis(500)));
        let transcripts = Arc::new(TranscriptStore::new(dir.path(), CorruptPolicy::Archive).unwrap());
        let provider = Arc::new(provider);
        let controller =
            ConversationController::new(provider.clone(), driver, transcripts, config).unwrap();
        Fixture {
            _dir: dir,
            launcher,
            provider,
            controller,
        }
    }

    fn history(user: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::system("sys"), ChatMessage::user(user)]
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.model, "qwen3");
        assert_eq!(config.max_rounds, 10);
        assert!(config.system_prompt.is_none());
        assert!(config.enable_execution);
        assert_eq!(config.languages, vec!["python", "py", "python3"]);
    }

    #[test]
    fn test_follow_up_format() {
        let ok = ExecutionResult::success("3");
        let empty = ExecutionResult::success("  \n");
        let failed = ExecutionResult::failure("", "NameError: x", Termination::Errored);

        let blocks = vec![
            format_block_result(0, &ok),
            format_block_result(1, &empty),
            format_block_result(2, &failed),
        ];
        assert_eq!(blocks[0], "Code Block 1 Execution Results:\n3");
        assert_eq!(
            blocks[1],
            "Code Block 2 Execution Results:\n(Code executed successfully with no output)"
        );
        assert_eq!(
            blocks[2],
            "Code Block 3 Execution Results:\nExecution Error:\nNameError: x"
        );

        let follow_up = format_follow_up(&blocks[..2]);
        assert_eq!(
            follow_up,
            "BLOCK_RESPONSE\n\n\nHere are the results of executing your code:\n\n\n\
             Code Block 1 Execution Results:\n3\n\n---\n\n\
             Code Block 2 Execution Results:\n(Code executed successfully with no output)\n\n\
             Perform the next step of your analysis based on these results, \
             or provide your final answer if the analysis is complete."
        );
    }

    #[tokio::test]
    async fn test_reply_without_code_completes_immediately() {
        let fx = fixture(ScriptedProvider::new(["No code needed."]), AgentConfig::default());
        let mut messages = history("hello");

        let turn = fx
            .controller
            .run_turn("p", &mut messages, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.outcome, TurnOutcome::Completed);
        assert_eq!(turn.final_response, "No code needed.");
        assert_eq!(turn.rounds, 0);
        assert_eq!(turn.provider_calls, 1);
        assert!(turn.executions.is_empty());
        assert_eq!(fx.launcher.launches(), 0);
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn test_errors_are_fed_back() {
        let fx = fixture(
            ScriptedProvider::new(["```python\nprint(missing)\n```", "I see the error."]),
            AgentConfig::default(),
        );
        let mut messages = history("go");

        let turn = fx
            .controller
            .run_turn("p", &mut messages, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.outcome, TurnOutcome::Completed);
        assert!(!turn.executions[0].result.success);

        let requests = fx.provider.requests();
        let follow_up = &requests[1].last().unwrap().content;
        assert!(follow_up.contains("Execution Error:\nTraceback (most recent call last):"));
        assert!(follow_up.contains("NameError: name 'missing' is not defined"));
    }

    #[tokio::test]
    async fn test_execution_disabled_skips_code() {
        let config = AgentConfig {
            enable_execution: false,
            ..AgentConfig::default()
        };
        let fx = fixture(ScriptedProvider::always("```python\nx = 1\n```"), config);
        assert!(!fx.controller.config().enable_execution);
        let mut messages = history("go");

        let turn = fx
            .controller
            .run_turn("p", &mut messages, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.outcome, TurnOutcome::Completed);
        assert_eq!(turn.provider_calls, 1);
        assert_eq!(fx.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_blocks_recorded_in_transcript() {
        let fx = fixture(
            ScriptedProvider::new(["```python\nx = 1\n```\n```python\nprint(x)\n```", "done"]),
            AgentConfig::default(),
        );
        let mut messages = history("go");
        fx.controller
            .run_turn("p", &mut messages, &CancellationToken::new())
            .await
            .unwrap();

        let doc = fx.controller.transcripts().load("p").await.unwrap();
        assert_eq!(doc.cells.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture(ScriptedProvider::always("hi"), AgentConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .controller
            .run_turn("p", &mut history("go"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(fx.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_execution() {
        let fx = fixture(
            ScriptedProvider::always("```python\nsleep 5000\n```"),
            AgentConfig::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = fx
            .controller
            .run_turn("p", &mut history("go"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(fx.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_kernel_unavailable_aborts_turn() {
        let fx = fixture(
            ScriptedProvider::always("```python\nx = 1\n```"),
            AgentConfig::default(),
        );
        fx.launcher.set_failing(true);

        let err = fx
            .controller
            .run_turn("p", &mut history("go"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::KernelUnavailable(_)));
    }
}
