
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use std::str::SplitWhitespace;
use std::sync::Arc;
use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::{Result, StudyError};

/// A token-bounded piece of extracted text ready for embedding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Words of the chunk joined by single spaces
    pub text: String,
    /// Sum of the token counts of the chunk's words
    pub token_count: usize,
}

/// Configuration for chunking and page filtering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk
    pub max_tokens: usize,
    /// Pages must have more characters than this after trimming to be kept
    pub min_page_chars: usize,
    /// Render and OCR pages that have no text layer
    pub ocr_fallback: bool,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_tokens: 500,
            min_page_chars: 50,
            ocr_fallback: true,
        }
    }
}

/// Counts tokens with the fixed `cl100k_base` vocabulary
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").finish_non_exhaustive()
    }
}

impl Tokenizer {
    #[inline]
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| StudyError::Config(format!("Failed to load cl100k_base: {e}")))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    #[inline]
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

/// Greedy word-by-word chunker
#[derive(Debug, Clone)]
pub struct Chunker {
    tokenizer: Tokenizer,
    max_tokens: usize,
}

impl Chunker {
    #[inline]
    pub fn new(tokenizer: Tokenizer, max_tokens: usize) -> Self {
        Self {
            tokenizer,
            max_tokens: max_tokens.max(1),
        }
    }

    #[inline]
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self::new(Tokenizer::cl100k()?, config.max_tokens))
    }

    #[inline]
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    #[inline]
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Lazily split `text` into chunks of at most `max_tokens` tokens.
    ///
    /// Words are never split. A single word longer than the limit is
    /// emitted on its own.
    #[inline]
    pub fn chunks<'a>(&'a self, text: &'a str) -> Chunks<'a> {
        Chunks {
            words: text.split_whitespace(),
            tokenizer: &self.tokenizer,
            max_tokens: self.max_tokens,
            pending: None,
        }
    }

    /// Eagerly chunk `text`, logging a summary
    pub fn chunk_text(&self, text: &str) -> Vec<TextChunk> {
        let chunks: Vec<TextChunk> = self.chunks(text).collect();
        debug!(
            "Chunked {} characters into {} chunks (avg {} tokens)",
            text.len(),
            chunks.len(),
            chunks.iter().map(|c| c.token_count).sum::<usize>() / chunks.len().max(1)
        );
        chunks
    }
}

/// Iterator returned by [`Chunker::chunks`]
pub struct Chunks<'a> {
    words: SplitWhitespace<'a>,
    tokenizer: &'a Tokenizer,
    max_tokens: usize,
    pending: Option<(&'a str, usize)>,
}

impl Iterator for Chunks<'_> {
    type Item = TextChunk;

    fn next(&mut self) -> Option<Self::Item> {
        let mut words: Vec<&str> = Vec::new();
        let mut token_count = 0;

        if let Some((word, tokens)) = self.pending.take() {
            words.push(word);
            token_count = tokens;
        }

        for word in self.words.by_ref() {
            let word_tokens = self.tokenizer.count(word);
            if !words.is_empty() && token_count + word_tokens > self.max_tokens {
                self.pending = Some((word, word_tokens));
                break;
            }
            words.push(word);
            token_count += word_tokens;
        }

        if words.is_empty() {
            return None;
        }

        Some(TextChunk {
            text: words.join(" "),
            token_count,
        })
    }
}

impl FusedIterator for Chunks<'_> {}
