// Index module
// Parallel chunk / vector / lexical collections, built off to the side and swapped in whole

pub mod lexical;
pub mod snapshot;
pub mod vector;


use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::info;

use crate::{Result, StudyError};

pub use lexical::LexicalIndex;
pub use vector::VectorIndex;

/// Position of a chunk in its generation. The same position addresses the
/// chunk list, the vector index and the lexical index.
pub type ChunkId = usize;

/// A named collection of course material with its own index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusId {
    /// Lecture notes and textbooks, used by chat and flashcards
    Course,
    /// Past exams, used as style references for practice exams
    Exams,
    /// Documents uploaded ad hoc by a student
    Uploads,
}

impl CorpusId {
    pub const ALL: [CorpusId; 3] = [CorpusId::Course, CorpusId::Exams, CorpusId::Uploads];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            CorpusId::Course => "course",
            CorpusId::Exams => "exams",
            CorpusId::Uploads => "uploads",
        }
    }
}

impl std::fmt::Display for CorpusId {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorpusId {
    type Err = StudyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "course" => Ok(CorpusId::Course),
            "exams" => Ok(CorpusId::Exams),
            "uploads" => Ok(CorpusId::Uploads),
            other => Err(StudyError::Validation(format!(
                "unknown corpus '{other}' (expected course, exams or uploads)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    pub document_name: String,
    /// Position of the chunk within its document
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
}

/// One immutable, fully built index over a corpus
#[derive(Debug, Clone)]
pub struct IndexGeneration {
    chunks: Vec<Chunk>,
    vectors: VectorIndex,
    lexical: LexicalIndex,
}

impl IndexGeneration {
    #[inline]
    pub fn empty(dimension: usize) -> Self {
        IndexBuilder::new(dimension).build()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    #[inline]
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    #[inline]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    #[inline]
    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    #[inline]
    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn document_count(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.document_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Accumulates chunk/vector pairs for the next generation
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    chunks: Vec<Chunk>,
    vectors: VectorIndex,
}

impl IndexBuilder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            chunks: Vec::new(),
            vectors: VectorIndex::new(dimension),
        }
    }

    /// Start from the contents of an existing generation
    #[inline]
    pub fn from_generation(generation: &IndexGeneration) -> Self {
        Self {
            chunks: generation.chunks.clone(),
            vectors: generation.vectors.clone(),
        }
    }

    /// Add a chunk with its vector. Nothing is added if the vector is rejected.
    pub fn push(&mut self, chunk: Chunk, vector: &[f32]) -> Result<ChunkId> {
        let id = self.vectors.insert(vector)?;
        self.chunks.push(chunk);
        debug_assert_eq!(self.chunks.len(), self.vectors.len());
        Ok(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn build(self) -> IndexGeneration {
        let texts: Vec<&str> = self.chunks.iter().map(|c| c.text.as_str()).collect();
        let lexical = LexicalIndex::build(&texts);
        IndexGeneration {
            chunks: self.chunks,
            vectors: self.vectors,
            lexical,
        }
    }
}

/// The live generation of one corpus plus its single-writer lock
#[derive(Debug)]
pub struct CorpusIndex {
    id: CorpusId,
    current: RwLock<Arc<IndexGeneration>>,
    writer: Mutex<()>,
}

impl CorpusIndex {
    #[inline]
    pub fn new(id: CorpusId, dimension: usize) -> Self {
        Self::with_generation(id, IndexGeneration::empty(dimension))
    }

    #[inline]
    pub fn with_generation(id: CorpusId, generation: IndexGeneration) -> Self {
        Self {
            id,
            current: RwLock::new(Arc::new(generation)),
            writer: Mutex::new(()),
        }
    }

    #[inline]
    pub fn id(&self) -> CorpusId {
        self.id
    }

    /// The generation readers should use right now
    pub async fn current(&self) -> Arc<IndexGeneration> {
        Arc::clone(&*self.current.read().await)
    }

    /// Wait for exclusive write access to this corpus
    pub async fn writer(&self) -> CorpusWriter<'_> {
        CorpusWriter {
            corpus: self,
            _guard: self.writer.lock().await,
        }
    }
}

/// Exclusive write access to a corpus; readers keep seeing the old
/// generation until [`CorpusWriter::publish`]. The lock is held until the
/// writer is dropped, so work that must follow a publish in order (such as
/// persisting it) belongs before the drop.
pub struct CorpusWriter<'a> {
    corpus: &'a CorpusIndex,
    _guard: MutexGuard<'a, ()>,
}

impl CorpusWriter<'_> {
    /// Builder seeded with the live generation's contents
    pub async fn builder(&self) -> IndexBuilder {
        IndexBuilder::from_generation(&*self.corpus.current().await)
    }

    /// Swap `generation` in for readers
    pub async fn publish(&self, generation: IndexGeneration) -> Arc<IndexGeneration> {
        let generation = Arc::new(generation);
        *self.corpus.current.write().await = Arc::clone(&generation);
        info!(
            "Published {} corpus: {} chunks from {} documents",
            self.corpus.id,
            generation.len(),
            generation.document_count()
        );
        generation
    }
}
