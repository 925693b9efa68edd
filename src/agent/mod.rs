//! Agent module for the LLM code-execution loop
//!
//! This module provides the conversation side of the orchestrator:
//! - Fenced code block extraction from model replies
//! - The bounded conversation loop controller
//! - Project sessions tying conversations to kernels and transcripts
//!
//! # Architecture
//!
//! ```text
//! User message → SessionManager.chat() → ConversationController.run_turn()
//!                  ↓
//!           ChatProvider.complete() → reply
//!                  ↓
//!           CodeExtractor → [block 1, block 2, ...]   (none → turn complete)
//!                  ↓
//!           ExecutionDriver.execute() per block, in order
//!                  ↓
//!           TranscriptStore.append() per block
//!                  ↓
//!           Follow-up "BLOCK_RESPONSE ..." message → next round
//!           (round cap reached → turn inconclusive)
//! ```

pub mod controller;
pub mod extract;
pub mod prompt;
pub mod sessions;

pub use controller::{
    format_block_result, format_follow_up, AgentConfig, AgentError, ConversationController,
    ExecutionRecord, TurnOutcome, TurnResult,
};
pub use extract::{extract_code_blocks, CodeBlock, CodeExtractor};
pub use prompt::{load_system_prompt, DEFAULT_SYSTEM_PROMPT};
pub use sessions::{Conversation, SessionManager, SessionSummary, UploadedFile};
