// Study service
// The one object owning every corpus, cache and client; all operations go through it

#[cfg(test)]
mod tests;

use futures::stream;
use futures::{FutureExt, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::{Database, Difficulty, FeedbackStatistics};
use crate::embeddings::{Chunker, EmbeddingCache, EmbeddingService, OpenAiClient};
use crate::feedback::{FeedbackLoop, FeedbackOutcome};
use crate::generation::prompts::exam_reference;
use crate::generation::{
    ChatMessage, CompletionOptions, CompletionService, DEFAULT_EXAM_REFERENCE, FinishHook,
    GenerationOrchestrator, GenerationRequest, GenerationStream, TaskContext,
};
use crate::index::{Chunk, CorpusId, CorpusIndex, IndexBuilder, IndexGeneration, snapshot};
use crate::ingest::{Document, DocumentIngestor, collect_documents};
use crate::retrieval::{HybridRetriever, Retrieval};
use crate::{Result, StudyError};

/// Chunks retrieved as flashcard material
pub const FLASHCARD_CONTEXT_CHUNKS: usize = 3;
pub const DEFAULT_FLASHCARD_COUNT: usize = 10;
/// Name of the document seeded into an exam corpus that has no usable material
pub const DEFAULT_EXAM_DOCUMENT: &str = "default_exam.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub document_name: String,
    pub chunks_added: usize,
    /// Chunks left out because they could not be embedded
    pub chunks_skipped: usize,
}

#[derive(Debug)]
pub struct DocumentFailure {
    pub document_name: String,
    pub error: StudyError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub documents: Vec<IngestReport>,
    pub failures: Vec<DocumentFailure>,
}

impl BatchReport {
    #[inline]
    pub fn chunks_added(&self) -> usize {
        self.documents.iter().map(|d| d.chunks_added).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    pub question: String,
    pub answer: String,
}

/// Where a piece of flashcard context came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkSource {
    pub document_name: String,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashcardSet {
    pub flashcards: Vec<Flashcard>,
    /// Material the cards were generated from, reusable for regeneration
    pub context: Vec<String>,
    pub sources: Vec<ChunkSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CorpusStatus {
    pub corpus: CorpusId,
    pub chunks: usize,
    pub documents: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub corpora: Vec<CorpusStatus>,
    pub cached_embeddings: u64,
    pub feedback: FeedbackStatistics,
}

#[derive(Debug)]
struct Corpora {
    course: CorpusIndex,
    exams: CorpusIndex,
    uploads: CorpusIndex,
}

impl Corpora {
    fn load(snapshot_dir: &Path, dimension: usize) -> Self {
        let open = |id: CorpusId| match snapshot::load(snapshot_dir, id, dimension) {
            Ok(Some(generation)) => CorpusIndex::with_generation(id, generation),
            Ok(None) => CorpusIndex::new(id, dimension),
            Err(e) => {
                warn!("Ignoring unreadable {} snapshot: {:#}", id, e);
                CorpusIndex::new(id, dimension)
            }
        };
        Self {
            course: open(CorpusId::Course),
            exams: open(CorpusId::Exams),
            uploads: open(CorpusId::Uploads),
        }
    }

    #[inline]
    fn get(&self, id: CorpusId) -> &CorpusIndex {
        match id {
            CorpusId::Course => &self.course,
            CorpusId::Exams => &self.exams,
            CorpusId::Uploads => &self.uploads,
        }
    }
}

pub struct StudyService {
    ingestor: DocumentIngestor,
    chunker: Chunker,
    embeddings: EmbeddingCache,
    retriever: HybridRetriever,
    orchestrator: GenerationOrchestrator,
    feedback: FeedbackLoop,
    corpora: Corpora,
    snapshot_dir: PathBuf,
    top_k: usize,
    embedding_concurrency: usize,
}

impl StudyService {
    /// Connect to the configured services and open the local stores
    pub async fn open(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| StudyError::Config(e.to_string()))?;
        let client = Arc::new(OpenAiClient::new(&config.service)?);
        let database = Database::initialize_from_config_dir(config.get_base_dir())
            .await
            .map_err(StudyError::database)?;
        Self::new(config, client.clone(), client, database)
    }

    /// Assemble the service around the given external collaborators
    pub fn new(
        config: &Config,
        embedder: Arc<dyn EmbeddingService>,
        completion: Arc<dyn CompletionService>,
        database: Database,
    ) -> Result<Self> {
        let dimension = embedder.dimension();
        if dimension != config.embedding_dimension() {
            return Err(StudyError::DimensionMismatch {
                expected: config.embedding_dimension(),
                actual: dimension,
            });
        }

        let embeddings = EmbeddingCache::new(embedder, config.retrieval.cache_capacity);
        let retriever = HybridRetriever::new(embeddings.clone(), config.retrieval.query_timeout());
        let orchestrator = GenerationOrchestrator::new(
            completion,
            CompletionOptions::from(&config.service),
        );
        let snapshot_dir = config.snapshot_dir();

        Ok(Self {
            ingestor: DocumentIngestor::new(&config.chunking),
            chunker: Chunker::from_config(&config.chunking)?,
            feedback: FeedbackLoop::new(database, orchestrator.clone()),
            corpora: Corpora::load(&snapshot_dir, dimension),
            embeddings,
            retriever,
            orchestrator,
            snapshot_dir,
            top_k: config.retrieval.top_k,
            embedding_concurrency: config.retrieval.embedding_concurrency.max(1),
        })
    }

    /// Replace the text extraction backends
    #[inline]
    pub fn with_ingestor(mut self, ingestor: DocumentIngestor) -> Self {
        self.ingestor = ingestor;
        self
    }

    #[inline]
    pub fn feedback(&self) -> &FeedbackLoop {
        &self.feedback
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn generation(&self, corpus: CorpusId) -> Arc<IndexGeneration> {
        self.corpora.get(corpus).current().await
    }

    /// Ingest one document and publish it.
    pub async fn ingest(&self, corpus: CorpusId, document: Document) -> Result<IngestReport> {
        let mut report = self
            .ingest_batch(corpus, vec![document], &CancellationToken::new())
            .await?;
        if let Some(failure) = report.failures.pop() {
            return Err(failure.error);
        }
        report
            .documents
            .pop()
            .ok_or_else(|| StudyError::Extraction("document produced no report".to_string()))
    }

    /// Ingest `documents` into a new generation of `corpus` and publish it
    /// once every document has been processed.
    ///
    /// A document that cannot be extracted or embedded is reported and left
    /// out. Fatal errors and cancellation abandon the whole batch, leaving
    /// the live generation untouched.
    pub async fn ingest_batch(
        &self,
        corpus: CorpusId,
        documents: Vec<Document>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let index = self.corpora.get(corpus);
        let writer = index.writer().await;
        let mut builder = writer.builder().await;
        let mut report = BatchReport::default();

        let bar = if console::user_attended_stderr() {
            ProgressBar::new(documents.len() as u64).with_style(
                ProgressStyle::with_template("{bar:30} [{pos}/{len}] Ingesting {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            )
        } else {
            ProgressBar::hidden()
        };

        for document in documents {
            if cancel.is_cancelled() {
                bar.abandon();
                info!("Ingestion into {} cancelled", corpus);
                return Err(StudyError::Cancelled);
            }
            bar.set_message(document.name.clone());

            match self.ingest_into(&mut builder, &document, cancel).await {
                Ok(document_report) => report.documents.push(document_report),
                Err(e) if e.is_fatal() || matches!(e, StudyError::Cancelled) => {
                    bar.abandon();
                    error!("Abandoning ingestion into {}: {}", corpus, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", document.name, e);
                    report.failures.push(DocumentFailure {
                        document_name: document.name.clone(),
                        error: e,
                    });
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();

        if report.documents.is_empty() {
            debug!("Nothing ingested into {}, keeping current generation", corpus);
            return Ok(report);
        }

        let generation = writer.publish(builder.build()).await;
        self.save_snapshot(corpus, generation).await;
        drop(writer);
        Ok(report)
    }

    async fn ingest_into(
        &self,
        builder: &mut IndexBuilder,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let extracted = self.ingestor.extract(document).await?;
        let embeddings = &self.embeddings;

        let mut pending = std::pin::pin!(
            stream::iter(self.chunker.chunks(&extracted.text).enumerate())
                .map(move |(ordinal, piece)| async move {
                    let vector = embeddings.embed(&piece.text).await;
                    (ordinal, piece, vector)
                })
                .buffered(self.embedding_concurrency)
        );

        let mut report = IngestReport {
            document_id: extracted.document_id.clone(),
            document_name: extracted.document_name.clone(),
            chunks_added: 0,
            chunks_skipped: 0,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StudyError::Cancelled),
                next = pending.next() => next,
            };
            let Some((ordinal, piece, vector)) = next else {
                break;
            };

            match vector {
                Ok(vector) => {
                    builder.push(
                        Chunk {
                            document_id: extracted.document_id.clone(),
                            document_name: extracted.document_name.clone(),
                            ordinal,
                            text: piece.text,
                            token_count: piece.token_count,
                        },
                        &vector,
                    )?;
                    report.chunks_added += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "Excluding chunk {} of {} from the index: {}",
                        ordinal, extracted.document_name, e
                    );
                    report.chunks_skipped += 1;
                }
            }
        }

        if report.chunks_added == 0 {
            return Err(StudyError::EmbeddingService(format!(
                "none of the {} chunks of '{}' could be embedded",
                report.chunks_skipped, extracted.document_name
            )));
        }

        info!(
            "Indexed {} chunks of {} ({} excluded)",
            report.chunks_added, report.document_name, report.chunks_skipped
        );
        Ok(report)
    }

    async fn save_snapshot(&self, corpus: CorpusId, generation: Arc<IndexGeneration>) {
        let dir = self.snapshot_dir.clone();
        let saved =
            tokio::task::spawn_blocking(move || snapshot::save(&dir, corpus, &generation)).await;
        match saved {
            Ok(Ok(path)) => debug!("Saved {} snapshot to {}", corpus, path.display()),
            Ok(Err(e)) => warn!("Failed to save {} snapshot: {:#}", corpus, e),
            Err(e) => warn!("Snapshot task for {} failed: {}", corpus, e),
        }
    }

    /// Ingest every supported file under `dir`.
    ///
    /// An exam corpus left without any material is seeded with the built-in
    /// reference exam so exam generation always has a style to imitate.
    pub async fn load_directory(
        &self,
        corpus: CorpusId,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let documents = collect_documents(dir)?;
        info!("Found {} documents in {}", documents.len(), dir.display());
        let mut report = self.ingest_batch(corpus, documents, cancel).await?;

        if corpus == CorpusId::Exams && self.generation(corpus).await.is_empty() {
            warn!("No usable exams in {}, using the default template", dir.display());
            let seed = Document::from_bytes(
                DEFAULT_EXAM_DOCUMENT,
                DEFAULT_EXAM_REFERENCE.as_bytes().to_vec(),
            )?;
            let seeded = self.ingest_batch(corpus, vec![seed], cancel).await?;
            report.documents.extend(seeded.documents);
            report.failures.extend(seeded.failures);
        }

        Ok(report)
    }

    /// Ranked context texts for `query`, or the no-context sentinel
    pub async fn retrieve(&self, corpus: CorpusId, query: &str, top_k: usize) -> Vec<String> {
        self.retriever
            .retrieve(self.corpora.get(corpus), query, top_k)
            .await
    }

    pub async fn retrieve_ranked(&self, corpus: CorpusId, query: &str, top_k: usize) -> Retrieval {
        let generation = self.generation(corpus).await;
        self.retriever.retrieve_ranked(&generation, query, top_k).await
    }

    async fn notes_or_empty(&self) -> Vec<String> {
        match self.feedback.improvement_notes().await {
            Ok(notes) => notes,
            Err(e) => {
                warn!("Generating without improvement notes: {}", e);
                Vec::new()
            }
        }
    }

    /// Answer a tutoring question with course context, streamed
    pub async fn chat(&self, question: &str, history: Vec<ChatMessage>) -> GenerationStream {
        let retrieval = self
            .retrieve_ranked(CorpusId::Course, question, self.top_k)
            .await;
        let request = GenerationRequest::new(TaskContext::Chat {
            question: question.to_string(),
        })
        .with_context(retrieval.context())
        .with_history(history)
        .with_improvement_notes(self.notes_or_empty().await);
        self.orchestrator.generate(&request)
    }

    /// Generate `count` flashcards about `topic` from the course corpus.
    ///
    /// Fails with [`StudyError::Validation`] when no course material matches
    /// the topic; the model is never asked to write cards without context.
    pub async fn flashcards(&self, topic: &str, count: usize) -> Result<FlashcardSet> {
        if topic.trim().is_empty() {
            return Err(StudyError::Validation("topic must not be empty".to_string()));
        }
        let retrieval = self
            .retrieve_ranked(CorpusId::Course, topic, FLASHCARD_CONTEXT_CHUNKS)
            .await;
        if retrieval.is_empty() {
            info!("No course material found for flashcards on '{}'", topic);
            return Err(StudyError::Validation(format!(
                "no relevant content found for '{}'",
                topic.trim()
            )));
        }
        let sources = retrieval
            .chunks
            .iter()
            .map(|r| ChunkSource {
                document_name: r.chunk.document_name.clone(),
                ordinal: r.chunk.ordinal,
            })
            .collect();

        let mut set = self.regenerate_flashcards(retrieval.texts(), count).await?;
        set.sources = sources;
        Ok(set)
    }

    /// Generate a fresh set of flashcards from previously returned context
    pub async fn regenerate_flashcards(
        &self,
        context: Vec<String>,
        count: usize,
    ) -> Result<FlashcardSet> {
        if count == 0 {
            return Err(StudyError::Validation(
                "flashcard count must be at least 1".to_string(),
            ));
        }
        if context.iter().all(|text| text.trim().is_empty()) {
            return Err(StudyError::Validation(
                "flashcards need course material as context".to_string(),
            ));
        }
        let request = GenerationRequest::new(TaskContext::Flashcards { count })
            .with_context(context.clone())
            .with_improvement_notes(self.notes_or_empty().await);
        let raw = self.orchestrator.complete(&request).await?;
        let flashcards = parse_flashcards(&raw)?;
        if flashcards.len() != count {
            warn!("Asked for {} flashcards, got {}", count, flashcards.len());
        }

        if let Err(e) = self.feedback.record_artifact("flashcards", raw.trim()).await {
            warn!("Failed to record flashcards artifact: {}", e);
        }

        Ok(FlashcardSet {
            flashcards,
            context,
            sources: Vec::new(),
        })
    }

    /// Stream a practice exam for `course`.
    ///
    /// Without an explicit difficulty the student's stored preference is
    /// used. A cleanly finished exam becomes the artifact that negative
    /// feedback critiques.
    pub async fn practice_exam(
        &self,
        course: &str,
        exam_type: &str,
        difficulty: Option<Difficulty>,
        user_id: Option<&str>,
    ) -> Result<GenerationStream> {
        if course.trim().is_empty() {
            return Err(StudyError::Validation("course must not be empty".to_string()));
        }
        let difficulty = match difficulty {
            Some(difficulty) => difficulty,
            None => self.feedback.difficulty_for(user_id).await?,
        };

        let retrieval = self.retrieve_ranked(CorpusId::Exams, course, 1).await;
        let reference = exam_reference(retrieval.chunks.first().map(|r| r.chunk.text.as_str()));
        debug!(
            "Exam reference for {} has {} characters ({} tier)",
            course,
            reference.len(),
            retrieval.tier
        );

        let request = GenerationRequest::new(TaskContext::PracticeExam {
            course: course.to_string(),
            exam_type: exam_type.to_string(),
            difficulty,
        })
        .with_context(vec![reference.to_string()])
        .with_improvement_notes(self.notes_or_empty().await);

        let feedback = self.feedback.clone();
        let on_finish: FinishHook = Box::new(move |exam: String| {
            async move {
                if let Err(e) = feedback.record_artifact("practice_exam", &exam).await {
                    warn!("Failed to record practice exam: {}", e);
                }
            }
            .boxed()
        });

        Ok(self.orchestrator.generate_with_hook(&request, Some(on_finish)))
    }

    pub async fn submit_feedback(
        &self,
        rating: &str,
        comment: &str,
        user_id: Option<&str>,
    ) -> Result<FeedbackOutcome> {
        self.feedback.submit_feedback(rating, comment, user_id).await
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        let mut corpora = Vec::with_capacity(CorpusId::ALL.len());
        for id in CorpusId::ALL {
            let generation = self.generation(id).await;
            corpora.push(CorpusStatus {
                corpus: id,
                chunks: generation.len(),
                documents: generation.document_count(),
            });
        }

        Ok(ServiceStatus {
            corpora,
            cached_embeddings: self.embeddings.len().await,
            feedback: self.feedback.statistics().await?,
        })
    }
}

impl std::fmt::Debug for StudyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyService")
            .field("snapshot_dir", &self.snapshot_dir)
            .field("top_k", &self.top_k)
            .field("embedding_concurrency", &self.embedding_concurrency)
            .finish_non_exhaustive()
    }
}

/// Parse the model's flashcard reply, tolerating code fences and prose
/// around the JSON array.
pub fn parse_flashcards(raw: &str) -> Result<Vec<Flashcard>> {
    let start = raw.find('[');
    let end = raw.rfind(']');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            return Err(StudyError::GenerationService(
                "flashcard reply contained no JSON array".to_string(),
            ));
        }
    };

    let flashcards: Vec<Flashcard> = serde_json::from_str(json).map_err(|e| {
        StudyError::GenerationService(format!("flashcard reply was not valid JSON: {e}"))
    })?;
    if flashcards.is_empty() {
        return Err(StudyError::GenerationService(
            "flashcard reply contained no flashcards".to_string(),
        ));
    }
    Ok(flashcards)
}
