
use moka::future::Cache;
use std::sync::Arc;
use tracing::{debug, warn};

use super::EmbeddingService;
use crate::{Result, StudyError};

/// Memoizing front-end for an [`EmbeddingService`].
///
/// Entries are keyed by the exact text. Concurrent misses for the same text
/// are coalesced into one service call. The cache is bounded by entry count;
/// evicted texts are simply embedded again on their next use.
#[derive(Clone)]
pub struct EmbeddingCache {
    service: Arc<dyn EmbeddingService>,
    entries: Cache<String, Arc<Vec<f32>>>,
}

impl EmbeddingCache {
    #[inline]
    pub fn new(service: Arc<dyn EmbeddingService>, capacity: u64) -> Self {
        Self {
            service,
            entries: Cache::builder().max_capacity(capacity).build(),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.service.dimension()
    }

    /// Return the vector for `text`, calling the service only on a miss.
    ///
    /// Service failures are propagated; nothing is cached for a failed text.
    pub async fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(hit) = self.entries.get(text).await {
            debug!("Embedding cache hit ({} chars)", text.len());
            return Ok(hit);
        }

        let service = Arc::clone(&self.service);
        let owned = text.to_string();
        self.entries
            .try_get_with(text.to_string(), async move {
                let vector = service.embed(&owned).await?;
                let expected = service.dimension();
                if vector.len() != expected {
                    return Err(StudyError::EmbeddingService(format!(
                        "service returned {} dimensions, expected {}",
                        vector.len(),
                        expected
                    )));
                }
                Ok(Arc::new(vector))
            })
            .await
            .map_err(|e: Arc<StudyError>| {
                warn!("Embedding request failed: {}", e);
                match e.as_ref() {
                    StudyError::EmbeddingService(message) => {
                        StudyError::EmbeddingService(message.clone())
                    }
                    other => StudyError::EmbeddingService(other.to_string()),
                }
            })
    }

    /// Number of cached entries after pending maintenance has run
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("dimension", &self.service.dimension())
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}
