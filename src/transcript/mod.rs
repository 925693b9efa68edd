//! Append-only transcripts of executed code and results
//!
//! One JSON document per project:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "cells": [
//!     { "kind": "code", "source": "x = 1" },
//!     { "kind": "code", "source": "print(x)" },
//!     { "kind": "note", "content": "**Output:**\n```\n1\n\n```" }
//!   ]
//! }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod store;

pub use store::{AppendOutcome, CorruptPolicy, TranscriptStore};

/// Current document format version
pub const FORMAT_VERSION: u32 = 1;

/// One transcript cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cell {
    /// Verbatim executed source
    Code { source: String },
    /// Formatted output and/or error of the preceding code cell
    Note { content: String },
}

/// The persisted transcript of one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptDocument {
    pub format_version: u32,
    pub cells: Vec<Cell>,
}

impl Default for TranscriptDocument {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            cells: Vec::new(),
        }
    }
}

impl TranscriptDocument {
    /// Append the cells recording one execution; returns how many were added
    pub fn record(&mut self, code: &str, output: &str, error: Option<&str>) -> usize {
        self.cells.push(Cell::Code {
            source: code.to_string(),
        });
        match format_note(output, error) {
            Some(content) => {
                self.cells.push(Cell::Note { content });
                2
            }
            None => 1,
        }
    }
}

/// Render the note cell for an execution, or `None` when there is nothing to show
pub fn format_note(output: &str, error: Option<&str>) -> Option<String> {
    let error = error.filter(|e| !e.is_empty());
    if output.is_empty() && error.is_none() {
        return None;
    }

    let mut content = String::from("**Output:**\n```\n");
    content.push_str(output);
    if let Some(error) = error {
        content.push_str("\n\n**Error:**\n");
        content.push_str(error);
    }
    content.push_str("\n```");
    Some(content)
}

/// Error type for transcript operations
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transcript {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize transcript: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid project id for a transcript: {0:?}")]
    InvalidProjectId(String),
}
