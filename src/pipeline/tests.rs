use super::*;
use crate::config::{RetrievalConfig, ServiceConfig};
use crate::embeddings::ChunkingConfig;
use crate::generation::GenerationEvent;
use crate::index::snapshot::snapshot_path;
use crate::ingest::{OcrEngine, PageExtractor};
use crate::retrieval::{NO_CONTEXT_SENTINEL, RetrievalTier};
use crate::test_support::{HashEmbedder, ScriptedCompletion};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const DIMENSION: usize = 128;

const DOC_1: &str = "Mitochondria produce ATP through cellular respiration. The electron transport chain sits on the inner membrane.";
const DOC_2: &str = "The hippocampus and amygdala belong to the limbic system, which governs memory and emotion.";

struct ScannedPages;

#[async_trait]
impl PageExtractor for ScannedPages {
    async fn pages(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(vec![String::new()])
    }
}

#[derive(Default)]
struct BlankOcr {
    calls: AtomicUsize,
}

#[async_trait]
impl OcrEngine for BlankOcr {
    async fn recognize_page(&self, _path: &Path, _page: usize) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("  ".to_string())
    }
}

fn config(dir: &Path) -> Config {
    Config {
        service: ServiceConfig {
            embedding_dimension: DIMENSION as u32,
            ..ServiceConfig::default()
        },
        chunking: ChunkingConfig {
            max_tokens: 64,
            ..ChunkingConfig::default()
        },
        retrieval: RetrievalConfig {
            query_timeout_seconds: 5,
            ..RetrievalConfig::default()
        },
        base_dir: dir.to_path_buf(),
    }
}

struct Fixture {
    service: StudyService,
    embedder: Arc<HashEmbedder>,
    completion: Arc<ScriptedCompletion>,
    dir: TempDir,
}

async fn fixture_with(embedder: HashEmbedder, completion: ScriptedCompletion) -> Fixture {
    let dir = TempDir::new().expect("should create TempDir successfully");
    fixture_in(dir, embedder, completion).await
}

async fn fixture_in(dir: TempDir, embedder: HashEmbedder, completion: ScriptedCompletion) -> Fixture {
    let database = Database::new(dir.path().join("medbot.db"))
        .await
        .expect("database");
    let embedder = Arc::new(embedder);
    let completion = Arc::new(completion);
    let service = StudyService::new(
        &config(dir.path()),
        embedder.clone(),
        completion.clone(),
        database,
    )
    .expect("service");
    Fixture {
        service,
        embedder,
        completion,
        dir,
    }
}

async fn fixture(completion: ScriptedCompletion) -> Fixture {
    fixture_with(HashEmbedder::new(DIMENSION), completion).await
}

fn text_document(name: &str, text: &str) -> Document {
    Document::from_bytes(name, text.as_bytes().to_vec()).expect("document")
}

async fn collect(stream: GenerationStream) -> Vec<GenerationEvent> {
    stream.collect().await
}

#[tokio::test]
async fn scanned_document_is_reported_and_the_rest_is_indexed() {
    let f = fixture(ScriptedCompletion::new(&[])).await;
    let ocr = Arc::new(BlankOcr::default());
    let service = f.service.with_ingestor(DocumentIngestor::with_backends(
        Arc::new(ScannedPages),
        Some(ocr.clone() as Arc<dyn OcrEngine>),
        50,
    ));

    let report = service
        .ingest_batch(
            CorpusId::Course,
            vec![
                text_document("doc1.txt", DOC_1),
                text_document("doc2.txt", DOC_2),
                Document::from_bytes("scan.pdf", b"%PDF-1.4".to_vec()).expect("pdf"),
            ],
            &CancellationToken::new(),
        )
        .await
        .expect("batch");

    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.documents.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].document_name, "scan.pdf");
    assert!(matches!(report.failures[0].error, StudyError::Extraction(_)));

    let retrieval = service
        .retrieve_ranked(CorpusId::Course, "hippocampus amygdala limbic", 1)
        .await;
    assert_eq!(retrieval.tier, RetrievalTier::Vector);
    assert_eq!(retrieval.chunks.len(), 1);
    assert_eq!(retrieval.chunks[0].chunk.document_name, "doc2.txt");
}

#[tokio::test]
async fn empty_corpus_retrieves_the_sentinel() {
    let f = fixture(ScriptedCompletion::new(&[])).await;

    let texts = f.service.retrieve(CorpusId::Course, "Krebs cycle", 5).await;

    assert_eq!(texts, vec![NO_CONTEXT_SENTINEL.to_string()]);
}

#[tokio::test]
async fn ingest_publishes_and_snapshots() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let path = dir.path().to_path_buf();
    let f = fixture_in(dir, HashEmbedder::new(DIMENSION), ScriptedCompletion::new(&[])).await;

    let report = f
        .service
        .ingest(CorpusId::Uploads, text_document("doc1.txt", DOC_1))
        .await
        .expect("ingest");

    assert!(report.chunks_added >= 1);
    assert_eq!(report.chunks_skipped, 0);
    let generation = f.service.generation(CorpusId::Uploads).await;
    assert_eq!(generation.len(), report.chunks_added);
    assert_eq!(generation.vectors().len(), generation.len());
    assert!(snapshot_path(&path.join("corpora"), CorpusId::Uploads).exists());

    let reopened = StudyService::new(
        &config(&path),
        Arc::new(HashEmbedder::new(DIMENSION)),
        Arc::new(ScriptedCompletion::new(&[])),
        Database::new(path.join("medbot.db")).await.expect("database"),
    )
    .expect("service");
    assert_eq!(reopened.generation(CorpusId::Uploads).await.len(), generation.len());
    assert!(reopened.generation(CorpusId::Course).await.is_empty());
}

#[tokio::test]
async fn concurrent_batches_leave_the_latest_generation_on_disk() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let path = dir.path().to_path_buf();
    let f = fixture_in(dir, HashEmbedder::new(DIMENSION), ScriptedCompletion::new(&[])).await;
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        f.service.ingest_batch(
            CorpusId::Course,
            vec![text_document("doc1.txt", DOC_1)],
            &cancel
        ),
        f.service.ingest_batch(
            CorpusId::Course,
            vec![text_document("doc2.txt", DOC_2)],
            &cancel
        ),
    );
    first.expect("first batch");
    second.expect("second batch");

    let live = f.service.generation(CorpusId::Course).await;
    assert_eq!(live.document_count(), 2);

    let reopened = StudyService::new(
        &config(&path),
        Arc::new(HashEmbedder::new(DIMENSION)),
        Arc::new(ScriptedCompletion::new(&[])),
        Database::new(path.join("medbot.db")).await.expect("database"),
    )
    .expect("service");
    let restored = reopened.generation(CorpusId::Course).await;
    assert_eq!(restored.len(), live.len());
    assert_eq!(restored.document_count(), 2);
}

#[tokio::test]
async fn chunks_that_fail_to_embed_are_excluded() {
    let text = "Mitochondria produce ATP through cellular respiration in nearly every living cell of the body. \
                Glycolysis splits glucose into pyruvate in the cytoplasm before the Krebs cycle begins. \
                The electron transport chain on the inner membrane pumps protons to drive ATP synthase. \
                Insulin released by the pancreas lowers blood glucose after a meal by promoting uptake.";
    let f = fixture_with(
        HashEmbedder::new(DIMENSION).failing_on("pancreas"),
        ScriptedCompletion::new(&[]),
    )
    .await;
    let service = f.service;

    let report = service
        .ingest(CorpusId::Course, text_document("mixed.txt", text))
        .await
        .expect("ingest");

    assert!(report.chunks_added >= 1);
    assert_eq!(report.chunks_skipped, 1);
    let generation = service.generation(CorpusId::Course).await;
    assert!(generation.chunks().iter().all(|c| !c.text.contains("pancreas")));
    assert_eq!(generation.len(), report.chunks_added);
}

#[tokio::test]
async fn document_that_cannot_be_embedded_fails_and_publishes_nothing() {
    let f = fixture_with(
        HashEmbedder::new(DIMENSION).failing_on("limbic"),
        ScriptedCompletion::new(&[]),
    )
    .await;

    let result = f
        .service
        .ingest(CorpusId::Course, text_document("doc2.txt", DOC_2))
        .await;

    assert!(matches!(result, Err(StudyError::EmbeddingService(_))));
    assert!(f.service.generation(CorpusId::Course).await.is_empty());
}

#[tokio::test]
async fn cancelled_batch_leaves_the_live_generation_alone() {
    let f = fixture(ScriptedCompletion::new(&[])).await;
    f.service
        .ingest(CorpusId::Course, text_document("doc1.txt", DOC_1))
        .await
        .expect("ingest");
    let before = f.service.generation(CorpusId::Course).await.len();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = f
        .service
        .ingest_batch(
            CorpusId::Course,
            vec![text_document("doc2.txt", DOC_2)],
            &cancel,
        )
        .await;

    assert!(matches!(result, Err(StudyError::Cancelled)));
    assert_eq!(f.service.generation(CorpusId::Course).await.len(), before);
}

#[tokio::test]
async fn empty_exam_directory_seeds_the_default_reference() {
    let f = fixture(ScriptedCompletion::new(&[])).await;
    let exams_dir = f.dir.path().join("exams");

    let report = f
        .service
        .load_directory(CorpusId::Exams, &exams_dir, &CancellationToken::new())
        .await
        .expect("load");

    assert!(exams_dir.is_dir());
    assert_eq!(report.documents.len(), 1);
    assert_eq!(report.documents[0].document_name, DEFAULT_EXAM_DOCUMENT);
    assert!(!f.service.generation(CorpusId::Exams).await.is_empty());
}

#[tokio::test]
async fn load_directory_ingests_course_files() {
    let f = fixture(ScriptedCompletion::new(&[])).await;
    let course_dir = f.dir.path().join("course_materials");
    std::fs::create_dir_all(&course_dir).expect("create dir");
    std::fs::write(course_dir.join("doc1.txt"), DOC_1).expect("write");
    std::fs::write(course_dir.join("doc2.txt"), DOC_2).expect("write");

    let report = f
        .service
        .load_directory(CorpusId::Course, &course_dir, &CancellationToken::new())
        .await
        .expect("load");

    assert_eq!(report.documents.len(), 2);
    assert!(report.failures.is_empty());
    assert_eq!(
        f.service.generation(CorpusId::Course).await.document_count(),
        2
    );
}

#[tokio::test]
async fn practice_exam_uses_stored_difficulty_and_records_the_artifact() {
    let f = fixture(ScriptedCompletion::new(&["Question 1: ", "What is ATP?"])).await;
    f.service
        .submit_feedback("good", "this was too hard", Some("u1"))
        .await
        .expect("feedback");

    let events = collect(
        f.service
            .practice_exam("Physiology", "Midterm", None, Some("u1"))
            .await
            .expect("exam"),
    )
    .await;

    assert_eq!(events.last(), Some(&GenerationEvent::Done));
    let requests = f.completion.requests();
    assert_eq!(requests.len(), 1);
    let system = &requests[0][0].content;
    assert!(system.contains("difficulty is easy"));
    assert!(system.contains(DEFAULT_EXAM_REFERENCE.trim()));
    assert_eq!(
        f.service
            .feedback()
            .last_artifact()
            .await
            .expect("artifact")
            .as_deref(),
        Some("Question 1: What is ATP?")
    );
}

#[tokio::test]
async fn failed_exam_stream_is_not_recorded() {
    let f = fixture(ScriptedCompletion::new(&["Question 1: ", "What"]).failing_after(1)).await;

    let events = collect(
        f.service
            .practice_exam("Physiology", "Final", Some(Difficulty::Hard), None)
            .await
            .expect("exam"),
    )
    .await;

    assert!(matches!(events[events.len() - 2], GenerationEvent::Error(_)));
    assert_eq!(events.last(), Some(&GenerationEvent::Done));
    assert!(f.service.feedback().last_artifact().await.expect("artifact").is_none());
}

#[tokio::test]
async fn flashcards_parse_the_reply_and_report_sources() {
    let reply = "```json\n[{\"question\": \"What produces ATP?\", \"answer\": \"Mitochondria\"},\n {\"question\": \"Where is the ETC?\", \"answer\": \"Inner membrane\"}]\n```";
    let f = fixture(ScriptedCompletion::new(&[]).with_reply(reply)).await;
    f.service
        .ingest(CorpusId::Course, text_document("doc1.txt", DOC_1))
        .await
        .expect("ingest");

    let set = f.service.flashcards("mitochondria ATP", 2).await.expect("flashcards");

    assert_eq!(set.flashcards.len(), 2);
    assert_eq!(set.flashcards[0].answer, "Mitochondria");
    assert_eq!(set.sources[0].document_name, "doc1.txt");
    assert!(set.context[0].contains("Mitochondria"));
    let user_prompt = &f.completion.requests()[0][1].content;
    assert!(user_prompt.contains("generate 2 high-quality flashcards"));
}

#[tokio::test]
async fn flashcards_without_course_material_are_refused() {
    let f = fixture(ScriptedCompletion::new(&[]).with_reply("[{\"question\": \"Q\", \"answer\": \"A\"}]")).await;

    let result = f.service.flashcards("Krebs cycle", 1).await;

    assert!(matches!(result, Err(StudyError::Validation(_))));
    assert!(f.completion.requests().is_empty());
    assert!(f.service.feedback().last_artifact().await.expect("artifact").is_none());

    let regenerated = f.service.regenerate_flashcards(Vec::new(), 1).await;
    assert!(matches!(regenerated, Err(StudyError::Validation(_))));
    assert!(f.completion.requests().is_empty());
}

#[tokio::test]
async fn unparsable_flashcards_are_a_generation_error() {
    let f = fixture(ScriptedCompletion::new(&[]).with_reply("Sorry, I cannot help with that.")).await;

    let result = f
        .service
        .regenerate_flashcards(vec![DOC_1.to_string()], 3)
        .await;

    assert!(matches!(result, Err(StudyError::GenerationService(_))));
}

#[test]
fn flashcard_parsing() {
    let cards = parse_flashcards("Here you go: [{\"question\": \"Q\", \"answer\": \"A\"}] Enjoy!")
        .expect("cards");
    assert_eq!(
        cards,
        vec![Flashcard {
            question: "Q".to_string(),
            answer: "A".to_string()
        }]
    );
    assert!(parse_flashcards("[]").is_err());
    assert!(parse_flashcards("[{\"question\": \"Q\"}]").is_err());
    assert!(parse_flashcards("no json").is_err());
}

#[tokio::test]
async fn chat_without_context_uses_the_general_prompt() {
    let f = fixture(ScriptedCompletion::new(&["ATP ", "is energy."])).await;

    let events = collect(
        f.service
            .chat("What is ATP?", vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")])
            .await,
    )
    .await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Content("ATP ".to_string()),
            GenerationEvent::Content("is energy.".to_string()),
            GenerationEvent::Done,
        ]
    );
    let messages = &f.completion.requests()[0];
    assert_eq!(messages.len(), 4);
    assert!(messages[0].content.contains("consult healthcare professionals"));
    assert_eq!(messages[3].content, "What is ATP?");
}

#[tokio::test]
async fn status_counts_corpora_and_feedback() {
    let f = fixture(ScriptedCompletion::new(&[])).await;
    f.service
        .ingest(CorpusId::Course, text_document("doc1.txt", DOC_1))
        .await
        .expect("ingest");
    f.service
        .submit_feedback("good", "", None)
        .await
        .expect("feedback");

    let status = f.service.status().await.expect("status");

    let course = status
        .corpora
        .iter()
        .find(|c| c.corpus == CorpusId::Course)
        .expect("course status");
    assert_eq!(course.documents, 1);
    assert!(course.chunks >= 1);
    assert!(status.cached_embeddings >= 1);
    assert_eq!(status.feedback.total, 1);
    assert!(f.embedder.calls() >= 1);
}

#[tokio::test]
async fn mismatched_embedder_dimension_is_fatal() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let database = Database::new(dir.path().join("medbot.db"))
        .await
        .expect("database");

    let result = StudyService::new(
        &config(dir.path()),
        Arc::new(HashEmbedder::new(DIMENSION / 2)),
        Arc::new(ScriptedCompletion::new(&[])),
        database,
    );

    assert!(matches!(
        result,
        Err(StudyError::DimensionMismatch {
            expected: DIMENSION,
            ..
        })
    ));
}
