// Deterministic in-process stand-ins for the hosted services

use async_trait::async_trait;
use futures::stream;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::embeddings::EmbeddingService;
use crate::generation::{ChatMessage, CompletionOptions, CompletionService, TokenStream};
use crate::{Result, StudyError};

/// Bag-of-words embedder: each lowercased word bumps one hashed bucket and the
/// vector is normalized, so texts sharing vocabulary land close together.
pub struct HashEmbedder {
    dimension: usize,
    calls: AtomicUsize,
    fail_containing: Option<String>,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
            fail_containing: None,
        }
    }

    /// Fail every text that contains `needle`
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_containing = Some(needle.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.fail_containing {
            if text.contains(needle.as_str()) {
                return Err(StudyError::EmbeddingService("service unavailable".to_string()));
            }
        }
        Ok(self.vector_for(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Completion service that replays a fixed token script
pub struct ScriptedCompletion {
    tokens: Vec<String>,
    fail_after: Option<usize>,
    reply: String,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            fail_after: None,
            reply: tokens.concat(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Emit `count` tokens, then fail the stream
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Reply returned by non-streaming completions
    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    fn record(&self, messages: &[ChatMessage]) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<String> {
        self.record(messages);
        if self.fail_after.is_some() {
            return Err(StudyError::GenerationService("upstream failure".to_string()));
        }
        Ok(self.reply.clone())
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<TokenStream> {
        self.record(messages);
        let mut items: Vec<Result<String>> = Vec::new();
        for (i, token) in self.tokens.iter().enumerate() {
            if self.fail_after == Some(i) {
                break;
            }
            items.push(Ok(token.clone()));
        }
        if self.fail_after.is_some() {
            items.push(Err(StudyError::GenerationService(
                "connection reset".to_string(),
            )));
        }
        Ok(Box::pin(stream::iter(items)))
    }
}
