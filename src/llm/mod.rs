//! LLM provider integration module
//!
//! This module provides the chat provider seam used by the conversation loop
//! and a client for Ollama's `/api/chat` endpoint.

pub mod chat;

pub use chat::{ChatError, ChatMessage, ChatProvider, OllamaChatClient, Role};
