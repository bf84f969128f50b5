// Embeddings module
// Token-bounded chunking, the memoizing embedding front-end and the hosted API client

pub mod cache;
pub mod chunking;
pub mod openai;

use async_trait::async_trait;

use crate::Result;

pub use cache::EmbeddingCache;
pub use openai::OpenAiClient;
pub use chunking::{ChunkingConfig, Chunker, Chunks, TextChunk, Tokenizer};

/// External service mapping text to a fixed-length vector
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Embed a single text. Failures surface as `StudyError::EmbeddingService`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this service returns
    fn dimension(&self) -> usize;
}
