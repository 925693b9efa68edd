//! Integration tests for the agent system
//!
//! These tests verify the conversation loop, round cap, session isolation
//! and feedback formatting against the in-process fake kernel. Tests that
//! need a real python3 or Ollama are marked #[ignore].

use std::sync::Arc;
use std::time::Duration;

use labkernel::agent::{
    AgentConfig, AgentError, ConversationController, SessionManager, TurnOutcome,
};
use labkernel::kernel::{ExecutionDriver, KernelConfig, KernelRegistry, ProcessLauncher};
use labkernel::llm::{ChatMessage, ChatProvider, Role};
use labkernel::test_support::{FakeLauncher, ScriptedProvider};
use labkernel::transcript::{Cell, CorruptPolicy, TranscriptStore};
use tokio_util::sync::CancellationToken;

struct Harness {
    _dir: tempfile::TempDir,
    launcher: Arc<FakeLauncher>,
    provider: Arc<ScriptedProvider>,
    controller: Arc<ConversationController>,
}

fn harness(provider: ScriptedProvider, config: AgentConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let registry = Arc::new(KernelRegistry::new(launcher.clone()));
    let driver = Arc::new(ExecutionDriver::new(registry, Duration::from_millis(500)));
    let transcripts = Arc::new(TranscriptStore::new(dir.path(), CorruptPolicy::Archive).unwrap());
    let provider = Arc::new(provider);
    let controller = Arc::new(
        ConversationController::new(provider.clone(), driver, transcripts, config).unwrap(),
    );
    Harness {
        _dir: dir,
        launcher,
        provider,
        controller,
    }
}

fn conversation(user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are helpful."),
        ChatMessage::user(user),
    ]
}

/// Test that AgentConfig can be customized
#[test]
fn test_agent_config_custom() {
    let config = AgentConfig {
        model: "codellama".to_string(),
        max_rounds: 5,
        system_prompt: Some("You are a helpful coding assistant.".to_string()),
        ..AgentConfig::default()
    };

    assert_eq!(config.model, "codellama");
    assert_eq!(config.max_rounds, 5);
    assert!(config.enable_execution);
}

/// Code on rounds 1 and 2, plain text on round 3: exactly three provider calls
#[tokio::test]
async fn test_loop_terminates_when_reply_has_no_code() {
    let h = harness(
        ScriptedProvider::new([
            "Let me set up.\n```python\nx = 20\n```",
            "Now compute.\n```python\ny = 22\nprint(y)\n```",
            "The answer is 42.",
        ]),
        AgentConfig::default(),
    );
    let mut messages = conversation("What is 20 + 22?");

    let turn = h
        .controller
        .run_turn("proj", &mut messages, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.provider.calls(), 3);
    assert_eq!(turn.provider_calls, 3);
    assert_eq!(turn.rounds, 2);
    assert_eq!(turn.outcome, TurnOutcome::Completed);
    assert_eq!(turn.final_response, "The answer is 42.");
    assert_eq!(turn.executions.len(), 2);
    assert!(!turn.trace_id.is_empty());

    // system, user, then (assistant, follow-up) x2, then final assistant
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
        ]
    );
    assert_eq!(h.launcher.launches(), 1);
}

/// A provider that always returns code stops at the round cap
#[tokio::test]
async fn test_round_cap_is_inconclusive() {
    let config = AgentConfig {
        max_rounds: 3,
        ..AgentConfig::default()
    };
    let h = harness(ScriptedProvider::always("```python\nx = 1\n```"), config);
    let mut messages = conversation("loop forever");

    let turn = h
        .controller
        .run_turn("proj", &mut messages, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.outcome, TurnOutcome::Inconclusive);
    assert_eq!(turn.rounds, 3);
    assert_eq!(turn.provider_calls, 4);
    // the reply that hit the cap is returned but not executed
    assert_eq!(turn.executions.len(), 3);
    assert_eq!(turn.final_response, "```python\nx = 1\n```");
    assert_eq!(
        h.controller.driver().registry().execution_count("proj"),
        3
    );
}

/// A round cap of zero never executes anything
#[tokio::test]
async fn test_zero_round_cap() {
    let config = AgentConfig {
        max_rounds: 0,
        ..AgentConfig::default()
    };
    let h = harness(ScriptedProvider::always("```python\nx = 1\n```"), config);

    let turn = h
        .controller
        .run_turn("proj", &mut conversation("go"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.outcome, TurnOutcome::Inconclusive);
    assert_eq!(turn.provider_calls, 1);
    assert!(turn.executions.is_empty());
    assert_eq!(h.launcher.launches(), 0);
}

/// Blocks of one reply run in order on the same kernel, sharing state
#[tokio::test]
async fn test_blocks_share_state_in_order() {
    let h = harness(
        ScriptedProvider::new([
            "```python\na = 5\n```\nthen\n```python\nprint(a)\n```\n```python\nb\n```",
            "done",
        ]),
        AgentConfig::default(),
    );

    let turn = h
        .controller
        .run_turn("proj", &mut conversation("go"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.executions.len(), 3);
    assert!(turn.executions[0].result.success);
    assert_eq!(turn.executions[1].result.output, "5\n");
    assert!(!turn.executions[2].result.success);
    assert_eq!(
        turn.executions.iter().map(|e| e.block_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    let requests = h.provider.requests();
    let follow_up = &requests[1].last().unwrap().content;
    assert!(follow_up.starts_with("BLOCK_RESPONSE\n\n\nHere are the results of executing your code:\n\n\n"));
    assert!(follow_up.contains(
        "Code Block 1 Execution Results:\n(Code executed successfully with no output)\n\n---\n\n\
         Code Block 2 Execution Results:\n5\n\n\n---\n\n\
         Code Block 3 Execution Results:\nExecution Error:\n"
    ));
    assert!(follow_up.ends_with(
        "Perform the next step of your analysis based on these results, \
         or provide your final answer if the analysis is complete."
    ));
}

/// Provider failures abort the turn with the provider's message verbatim
#[tokio::test]
async fn test_provider_failure_surfaced_verbatim() {
    let h = harness(
        ScriptedProvider::new(["```python\nx = 1\n```"]).then_fail("model overloaded, retry later"),
        AgentConfig::default(),
    );

    let err = h
        .controller
        .run_turn("proj", &mut conversation("go"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Provider(_)));
    assert_eq!(err.to_string(), "model overloaded, retry later");
}

/// Execution timeouts are feedback, not turn failures
#[tokio::test]
async fn test_timeout_is_fed_back() {
    let h = harness(
        ScriptedProvider::new(["```python\nprint(1)\nhang\n```", "gave up"]),
        AgentConfig::default(),
    );

    let turn = h
        .controller
        .run_turn("proj", &mut conversation("go"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.outcome, TurnOutcome::Completed);
    let result = &turn.executions[0].result;
    assert!(!result.success);
    assert_eq!(result.output, "1\n");
    assert!(result.error.as_deref().unwrap().contains("timed out"));

    let requests = h.provider.requests();
    let follow_up = &requests[1].last().unwrap().content;
    assert!(follow_up.contains("Execution Error:\nExecution timed out"));
}

/// A variable defined in project A is not visible in project B
#[tokio::test]
async fn test_session_isolation() {
    let h = harness(
        ScriptedProvider::new([
            "```python\nsecret = 7\n```",
            "stored",
            "```python\nprint(secret)\n```",
            "not found",
        ]),
        AgentConfig::default(),
    );
    let sessions = SessionManager::new(Arc::clone(&h.controller), "sys", None);
    let a = sessions.initiate().await.unwrap();
    let b = sessions.initiate().await.unwrap();
    assert_ne!(a, b);

    let cancel = CancellationToken::new();
    sessions.chat(&a, "store it", &cancel).await.unwrap();
    let turn = sessions.chat(&b, "read it", &cancel).await.unwrap();

    let result = &turn.executions[0].result;
    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .contains("NameError: name 'secret' is not defined"));
    assert_eq!(h.launcher.launches(), 2);

    let transcripts = h.controller.transcripts();
    assert_eq!(
        transcripts.load(&a).await.unwrap().cells,
        vec![Cell::Code {
            source: "secret = 7".into()
        }]
    );
    assert_eq!(transcripts.load(&b).await.unwrap().cells.len(), 2);

    sessions.shutdown().await;
}

/// Concurrent turns on different projects proceed independently
#[tokio::test]
async fn test_concurrent_projects() {
    let h = harness(
        ScriptedProvider::always("plain answer"),
        AgentConfig::default(),
    );
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&h.controller),
        "sys",
        Some("ready = 1".to_string()),
    ));

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(sessions.initiate().await.unwrap());
    }

    let tasks: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                sessions
                    .chat(&id, "hi", &CancellationToken::new())
                    .await
                    .unwrap()
            })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().final_response, "plain answer");
    }

    assert_eq!(h.launcher.launches(), 4);
    assert_eq!(
        h.controller.driver().registry().stats().await.live_kernels,
        4
    );
    sessions.shutdown().await;
    assert_eq!(
        h.controller.driver().registry().stats().await.live_kernels,
        0
    );
}

/// Full turn against a real python3 kernel
#[tokio::test]
#[ignore = "Requires python3 on PATH"]
async fn test_python_kernel_turn() {
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig::default();
    let registry = Arc::new(KernelRegistry::new(Arc::new(ProcessLauncher::new(config.clone()))));
    let driver = Arc::new(ExecutionDriver::new(registry, config.message_timeout));
    let transcripts = Arc::new(TranscriptStore::new(dir.path(), CorruptPolicy::Archive).unwrap());
    let provider = Arc::new(ScriptedProvider::new([
        "```python\nimport math\nvalues = [math.sqrt(x) for x in (4, 9, 16)]\n```",
        "```python\nsum(values)\n```",
        "The sum is 9.",
    ]));
    let controller = ConversationController::new(
        provider.clone() as Arc<dyn ChatProvider>,
        driver,
        transcripts,
        AgentConfig::default(),
    )
    .unwrap();

    let turn = controller
        .run_turn("py", &mut conversation("sum the roots"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.outcome, TurnOutcome::Completed);
    assert_eq!(turn.executions[1].result.output, "9.0");
    controller.driver().registry().shutdown_all().await;
}
