//! Fenced code block extraction from model replies
//!
//! An opening fence is three backticks followed by an accepted language tag.
//! A block runs to the nearest following closing fence, so a stray fence
//! inside a block ends it early rather than extending it to the last fence in
//! the reply.

use regex::Regex;

/// Language tags accepted by [`CodeExtractor::default`]
pub const DEFAULT_LANGUAGES: &[&str] = &["python", "py", "python3"];

/// A code fragment found in a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Position among the blocks of the same reply, from 0
    pub index: usize,
    /// The tag on the opening fence
    pub language: String,
    /// Source with surrounding whitespace trimmed
    pub source: String,
}

/// Finds tagged fenced code blocks in free-form text
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    pattern: Regex,
}

impl CodeExtractor {
    /// Build an extractor accepting the given language tags
    pub fn new<I, S>(languages: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tags: Vec<String> = languages
            .into_iter()
            .map(|l| regex::escape(l.as_ref().trim()))
            .filter(|l| !l.is_empty())
            .collect();
        // Longest first so "python3" is not read as "python" + "3"
        tags.sort_by(|a, b| b.len().cmp(&a.len()));

        let pattern = Regex::new(&format!(r"(?s)```({})\b\s*(.*?)```", tags.join("|")))?;
        Ok(Self { pattern })
    }

    /// Blocks in left-to-right order; empty when no complete tagged fence pair exists
    pub fn extract_code_blocks(&self, text: &str) -> Vec<CodeBlock> {
        self.pattern
            .captures_iter(text)
            .enumerate()
            .map(|(index, caps)| CodeBlock {
                index,
                language: caps[1].to_string(),
                source: caps[2].trim().to_string(),
            })
            .collect()
    }
}

lazy_static::lazy_static! {
    static ref DEFAULT_EXTRACTOR: CodeExtractor =
        CodeExtractor::new(DEFAULT_LANGUAGES).expect("built-in fence pattern is valid");
}

impl Default for CodeExtractor {
    fn default() -> Self {
        DEFAULT_EXTRACTOR.clone()
    }
}

/// Extract blocks with the default language tags
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    DEFAULT_EXTRACTOR.extract_code_blocks(text)
}
