
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::embeddings::EmbeddingCache;
use crate::index::{Chunk, ChunkId, CorpusIndex, IndexGeneration};
use crate::{Result, StudyError};

/// Returned in place of context when neither index has anything to offer
pub const NO_CONTEXT_SENTINEL: &str = "No relevant course material is available for this query.";

/// Which search produced a retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalTier {
    Vector,
    Lexical,
    None,
}

impl std::fmt::Display for RetrievalTier {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RetrievalTier::Vector => write!(f, "vector"),
            RetrievalTier::Lexical => write!(f, "lexical"),
            RetrievalTier::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub id: ChunkId,
    pub chunk: Chunk,
    /// Squared distance for vector hits, BM25 score for lexical hits
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Retrieval {
    pub tier: RetrievalTier,
    pub chunks: Vec<RankedChunk>,
}

impl Retrieval {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Ranked chunk texts, or the sentinel alone when nothing matched
    pub fn texts(&self) -> Vec<String> {
        if self.chunks.is_empty() {
            vec![NO_CONTEXT_SENTINEL.to_string()]
        } else {
            self.chunks.iter().map(|r| r.chunk.text.clone()).collect()
        }
    }

    /// Ranked chunk texts without the sentinel
    pub fn context(&self) -> Vec<String> {
        self.chunks.iter().map(|r| r.chunk.text.clone()).collect()
    }
}

/// Vector search first, lexical search second, sentinel last
#[derive(Debug, Clone)]
pub struct HybridRetriever {
    embeddings: EmbeddingCache,
    query_timeout: Duration,
}

impl HybridRetriever {
    #[inline]
    pub fn new(embeddings: EmbeddingCache, query_timeout: Duration) -> Self {
        Self {
            embeddings,
            query_timeout,
        }
    }

    /// Ranked chunk texts for `query`. Never fails.
    pub async fn retrieve(&self, corpus: &CorpusIndex, query: &str, top_k: usize) -> Vec<String> {
        self.retrieve_ranked(&*corpus.current().await, query, top_k)
            .await
            .texts()
    }

    /// Ranked chunks with their source and the tier that found them
    pub async fn retrieve_ranked(
        &self,
        generation: &IndexGeneration,
        query: &str,
        top_k: usize,
    ) -> Retrieval {
        let top_k = top_k.max(1);
        if query.trim().is_empty() {
            debug!("Blank query, returning no context");
            return Retrieval {
                tier: RetrievalTier::None,
                chunks: Vec::new(),
            };
        }

        match self.vector_search(generation, query, top_k).await {
            Ok(hits) if !hits.is_empty() => {
                debug!("Vector search returned {} chunks", hits.len());
                return Retrieval {
                    tier: RetrievalTier::Vector,
                    chunks: Self::resolve(generation, hits.into_iter().map(|(id, d)| (id, f64::from(d)))),
                };
            }
            Ok(_) => info!("Vector search found nothing, falling back to lexical search"),
            Err(e) if e.is_fatal() => {
                error!("Vector search misconfigured, falling back to lexical search: {}", e)
            }
            Err(e) => warn!("Vector search unavailable, falling back to lexical search: {}", e),
        }

        let hits = generation.lexical().top_n(query, top_k);
        if hits.is_empty() {
            info!("No context found for query");
            return Retrieval {
                tier: RetrievalTier::None,
                chunks: Vec::new(),
            };
        }

        debug!("Lexical search returned {} chunks", hits.len());
        Retrieval {
            tier: RetrievalTier::Lexical,
            chunks: Self::resolve(generation, hits.into_iter()),
        }
    }

    /// Embed the query and search the vector index
    pub async fn vector_search(
        &self,
        generation: &IndexGeneration,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(ChunkId, f32)>> {
        if generation.vectors().is_empty() {
            return Err(StudyError::IndexUnavailable(
                "vector index has no entries".to_string(),
            ));
        }

        let vector = tokio::time::timeout(self.query_timeout, self.embeddings.embed(query))
            .await
            .map_err(|_| {
                StudyError::EmbeddingService(format!(
                    "query embedding timed out after {:?}",
                    self.query_timeout
                ))
            })??;

        generation.vectors().search(&vector, top_k)
    }

    fn resolve(
        generation: &IndexGeneration,
        hits: impl Iterator<Item = (ChunkId, f64)>,
    ) -> Vec<RankedChunk> {
        hits.filter_map(|(id, score)| {
            generation.chunk(id).map(|chunk| RankedChunk {
                id,
                chunk: chunk.clone(),
                score,
            })
        })
        .collect()
    }
}
