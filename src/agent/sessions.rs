//! Project sessions: conversations tied to a kernel and a transcript
//!
//! [`SessionManager`] is the process-wide state object. It starts empty,
//! holds one conversation per project id, and on shutdown stops every kernel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::controller::{AgentError, ConversationController, TurnResult};
use crate::kernel::ExecutionResult;
use crate::llm::ChatMessage;

/// A file the user made available to a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub original_name: String,
    pub path: PathBuf,
}

/// Conversation state of one project
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    pub uploaded_files: Vec<UploadedFile>,
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: usize,
    pub files: usize,
    pub executions: u64,
}

/// Owns every project's conversation and drives turns through the controller
pub struct SessionManager {
    controller: Arc<ConversationController>,
    system_prompt: String,
    init_code: Option<String>,
    conversations: Mutex<HashMap<String, Arc<AsyncMutex<Conversation>>>>,
}

impl SessionManager {
    /// Create a manager with no sessions
    ///
    /// `init_code` runs in every new project's kernel at initiation.
    pub fn new(
        controller: Arc<ConversationController>,
        system_prompt: impl Into<String>,
        init_code: Option<String>,
    ) -> Self {
        Self {
            controller,
            system_prompt: system_prompt.into(),
            init_code: init_code.filter(|c| !c.trim().is_empty()),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn controller(&self) -> &Arc<ConversationController> {
        &self.controller
    }

    fn conversations(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<Conversation>>>> {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn conversation(&self, project_id: &str) -> Result<Arc<AsyncMutex<Conversation>>, AgentError> {
        self.conversations()
            .get(project_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownProject(project_id.to_string()))
    }

    /// Start a new project and return its id
    ///
    /// Creates the empty transcript, seeds the conversation with the system
    /// prompt and runs the initialization code in a fresh kernel.
    pub async fn initiate(&self) -> Result<String, AgentError> {
        let project_id = uuid::Uuid::now_v7().to_string();
        self.initiate_with_id(&project_id).await?;
        Ok(project_id)
    }

    /// Start a project under a caller-chosen id
    ///
    /// An id that already has a conversation is left untouched. Init code is
    /// skipped when the project's transcript already holds cells.
    pub async fn initiate_with_id(&self, project_id: &str) -> Result<(), AgentError> {
        if self.contains(project_id) {
            return Ok(());
        }

        let transcripts = self.controller.transcripts();
        let resumed = match transcripts.load(project_id).await {
            Ok(doc) => !doc.cells.is_empty(),
            Err(e) => {
                warn!(project_id, error = %e, "Failed to read transcript");
                false
            }
        };
        if let Err(e) = transcripts.ensure_exists(project_id).await {
            warn!(project_id, error = %e, "Failed to create transcript");
        }

        if let Some(code) = self.init_code.as_ref().filter(|_| !resumed) {
            let driver = self.controller.driver();
            let result = driver
                .execute(project_id, code, &CancellationToken::new())
                .await?;
            if !result.success {
                warn!(project_id, error = ?result.error, "Initialization code failed");
            }
            if let Err(e) = transcripts
                .append(project_id, code, &result.output, result.error.as_deref())
                .await
            {
                warn!(project_id, error = %e, "Failed to record initialization code");
            }
        }

        let conversation = Conversation {
            id: project_id.to_string(),
            created_at: Utc::now(),
            messages: vec![ChatMessage::system(self.system_prompt.clone())],
            uploaded_files: Vec::new(),
        };
        self.conversations()
            .insert(project_id.to_string(), Arc::new(AsyncMutex::new(conversation)));

        info!(project_id, resumed, "Session initiated");
        Ok(())
    }

    /// Whether a conversation exists for the project
    pub fn contains(&self, project_id: &str) -> bool {
        self.conversations().contains_key(project_id)
    }

    /// Make a file known to the project's subsequent messages
    pub async fn register_file(
        &self,
        project_id: &str,
        original_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<(), AgentError> {
        let conversation = self.conversation(project_id)?;
        let mut conversation = conversation.lock().await;
        let file = UploadedFile {
            original_name: original_name.into(),
            path: path.into(),
        };
        info!(project_id, file = %file.original_name, path = %file.path.display(), "Registered file");
        conversation.uploaded_files.push(file);
        Ok(())
    }

    /// Send a user message and run the turn to completion
    ///
    /// Turns for the same project are serialized. A failed turn leaves the
    /// conversation history as it was before the message.
    pub async fn chat(
        &self,
        project_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        let conversation = self.conversation(project_id)?;
        let mut conversation = conversation.lock().await;

        let content = with_file_context(message, &conversation.uploaded_files);
        let mark = conversation.messages.len();
        conversation.messages.push(ChatMessage::user(content));

        let result = self
            .controller
            .run_turn(project_id, &mut conversation.messages, cancel)
            .await;
        if result.is_err() {
            conversation.messages.truncate(mark);
        }
        result
    }

    /// Run code directly in the project's kernel and record it in the transcript
    pub async fn execute(
        &self,
        project_id: &str,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, AgentError> {
        self.conversation(project_id)?;
        let result = self.controller.driver().execute(project_id, code, cancel).await?;
        if let Err(e) = self
            .controller
            .transcripts()
            .append(project_id, code, &result.output, result.error.as_deref())
            .await
        {
            warn!(project_id, error = %e, "Failed to record execution in transcript");
        }
        Ok(result)
    }

    /// Conversation history of a project
    pub async fn history(&self, project_id: &str) -> Result<Vec<ChatMessage>, AgentError> {
        let conversation = self.conversation(project_id)?;
        let conversation = conversation.lock().await;
        Ok(conversation.messages.clone())
    }

    /// Summaries of every session, newest first
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let conversations: Vec<_> = self.conversations().values().cloned().collect();
        let registry = self.controller.driver().registry();

        let mut sessions = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let conversation = conversation.lock().await;
            sessions.push(SessionSummary {
                id: conversation.id.clone(),
                created_at: conversation.created_at,
                messages: conversation.messages.len(),
                files: conversation.uploaded_files.len(),
                executions: registry.execution_count(&conversation.id),
            });
        }
        sessions.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        sessions
    }

    /// Stop the project's kernel and forget its conversation
    ///
    /// The transcript stays on disk.
    pub async fn shutdown_project(&self, project_id: &str) {
        let removed = self.conversations().remove(project_id);
        self.controller.driver().registry().shutdown(project_id).await;
        if removed.is_some() {
            info!(project_id, "Session shut down");
        }
    }

    /// Stop every kernel and forget every conversation
    pub async fn shutdown(&self) {
        let count = {
            let mut conversations = self.conversations();
            let count = conversations.len();
            conversations.clear();
            count
        };
        self.controller.driver().registry().shutdown_all().await;
        info!(sessions = count, "All sessions shut down");
    }
}

/// Append the uploaded-file listing to a user message
pub fn with_file_context(message: &str, files: &[UploadedFile]) -> String {
    if files.is_empty() {
        return message.to_string();
    }

    let mut context = String::from("You have access to the following files:\n");
    for file in files {
        context.push_str(&format!(
            "- '{}' at path '{}'\n",
            file.original_name,
            file.path.display()
        ));
    }
    context.push_str("\nConsider these files for any analysis or operations requested by the user.");
    format!("{}\n\n{}", message, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::kernel::{ExecutionDriver, KernelRegistry};
    use crate::llm::Role;
    use crate::test_support::{FakeLauncher, ScriptedProvider};
    use crate::transcript::{Cell, CorruptPolicy, TranscriptStore};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        provider: Arc<ScriptedProvider>,
        sessions: SessionManager,
    }

    fn fixture(provider: ScriptedProvider, init_code: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let registry = Arc::new(KernelRegistry::new(launcher.clone()));
        let driver = Arc::new(ExecutionDriver::new(registry, Duration::from_millis(500)));
        let transcripts = Arc::new(TranscriptStore::new(dir.path(), CorruptPolicy::Archive).unwrap());
        let provider = Arc::new(provider);
        let controller = Arc::new(
            ConversationController::new(provider.clone(), driver, transcripts, AgentConfig::default())
                .unwrap(),
        );
        let sessions = SessionManager::new(controller, "sys", init_code.map(String::from));
        Fixture {
            _dir: dir,
            launcher,
            provider,
            sessions,
        }
    }

    #[test]
    fn test_file_context_suffix() {
        assert_eq!(with_file_context("hi", &[]), "hi");

        let files = vec![UploadedFile {
            original_name: "data.csv".into(),
            path: "/uploads/abc_data.csv".into(),
        }];
        assert_eq!(
            with_file_context("analyze", &files),
            "analyze\n\nYou have access to the following files:\n\
             - 'data.csv' at path '/uploads/abc_data.csv'\n\n\
             Consider these files for any analysis or operations requested by the user."
        );
    }

    #[tokio::test]
    async fn test_initiate_runs_init_code() {
        let fx = fixture(ScriptedProvider::always("ok"), Some("dataframes = {}"));
        let id = fx.sessions.initiate().await.unwrap();

        assert!(fx.sessions.contains(&id));
        assert_eq!(fx.launcher.launches(), 1);

        let history = fx.sessions.history(&id).await.unwrap();
        assert_eq!(history, vec![ChatMessage::system("sys")]);

        let doc = fx.sessions.controller().transcripts().load(&id).await.unwrap();
        assert_eq!(
            doc.cells,
            vec![Cell::Code {
                source: "dataframes = {}".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_initiate_with_existing_id_keeps_state() {
        let fx = fixture(ScriptedProvider::always("ok"), Some("dataframes = {}"));
        fx.sessions.initiate_with_id("proj").await.unwrap();
        fx.sessions
            .chat("proj", "hello", &CancellationToken::new())
            .await
            .unwrap();

        fx.sessions.initiate_with_id("proj").await.unwrap();
        assert_eq!(fx.sessions.history("proj").await.unwrap().len(), 3);

        // A fresh manager over the same transcripts resumes the project
        let restarted = SessionManager::new(
            Arc::clone(fx.sessions.controller()),
            "sys",
            Some("dataframes = {}".to_string()),
        );
        restarted.initiate_with_id("proj").await.unwrap();

        let doc = fx.sessions.controller().transcripts().load("proj").await.unwrap();
        assert_eq!(doc.cells.len(), 1);
        assert_eq!(fx.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_initiate_without_init_code_is_lazy() {
        let fx = fixture(ScriptedProvider::always("ok"), None);
        let id = fx.sessions.initiate().await.unwrap();
        assert_eq!(fx.launcher.launches(), 0);
        assert!(fx
            .sessions
            .controller()
            .transcripts()
            .path(&id)
            .unwrap()
            .exists());
    }

    #[tokio::test]
    async fn test_chat_unknown_project() {
        let fx = fixture(ScriptedProvider::always("ok"), None);
        let err = fx
            .sessions
            .chat("nope", "hi", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UnknownProject(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_chat_includes_file_context() {
        let fx = fixture(ScriptedProvider::always("fine"), None);
        let id = fx.sessions.initiate().await.unwrap();
        fx.sessions
            .register_file(&id, "data.csv", "/tmp/data.csv")
            .await
            .unwrap();

        fx.sessions
            .chat(&id, "look", &CancellationToken::new())
            .await
            .unwrap();

        let sent = &fx.provider.requests()[0];
        assert_eq!(sent[1].role, Role::User);
        assert!(sent[1].content.starts_with("look\n\nYou have access"));
        assert!(sent[1].content.contains("'data.csv' at path '/tmp/data.csv'"));
    }

    #[tokio::test]
    async fn test_failed_turn_rolls_back_history() {
        let fx = fixture(ScriptedProvider::new(["first"]).then_fail("provider down"), None);
        let id = fx.sessions.initiate().await.unwrap();

        fx.sessions
            .chat(&id, "one", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.sessions.history(&id).await.unwrap().len(), 3);

        let err = fx
            .sessions
            .chat(&id, "two", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "provider down");
        assert_eq!(fx.sessions.history(&id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let fx = fixture(ScriptedProvider::always("ok"), Some("x = 1"));
        let a = fx.sessions.initiate().await.unwrap();
        let b = fx.sessions.initiate().await.unwrap();

        let listed = fx.sessions.list_sessions().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b);
        assert_eq!(listed[1].executions, 1);

        fx.sessions.shutdown_project(&a).await;
        assert!(!fx.sessions.contains(&a));
        assert!(!fx.sessions.controller().driver().registry().contains(&a).await);

        fx.sessions.shutdown().await;
        assert!(fx.sessions.list_sessions().await.is_empty());
        assert_eq!(
            fx.sessions.controller().driver().registry().stats().await.live_kernels,
            0
        );
    }
}
