//! System prompt loading

use std::path::Path;

use tracing::{debug, warn};

/// Prompt used when no prompt file is available
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert data analysis assistant with access to a \
persistent Python session. To run code, reply with one or more ```python fenced blocks; variables \
persist between blocks and between replies. After each round you will receive the execution results. \
Analyze the data the user provides and, once the analysis is complete, give your final answer \
without any code blocks.";

/// Read the system prompt from `path`, falling back to [`DEFAULT_SYSTEM_PROMPT`]
pub fn load_system_prompt(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(prompt) if !prompt.trim().is_empty() => {
            debug!(path = %path.display(), "Loaded system prompt");
            prompt.trim().to_string()
        }
        Ok(_) => {
            warn!(path = %path.display(), "System prompt file is empty, using default prompt");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "System prompt file unreadable, using default prompt");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}
