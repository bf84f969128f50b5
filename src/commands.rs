use anyhow::{Context, Result};
use console::style;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, get_config_dir};
use crate::database::Difficulty;
use crate::embeddings::OpenAiClient;
use crate::generation::{GenerationEvent, GenerationStream};
use crate::index::CorpusId;
use crate::ingest::Document;
use crate::pipeline::{BatchReport, StudyService};

fn load_config() -> Result<Config> {
    let dir = get_config_dir()?;
    Config::load(&dir).context("Failed to load configuration")
}

async fn open_service() -> Result<StudyService> {
    let config = load_config()?;
    StudyService::open(&config)
        .await
        .context("Failed to start the study service")
}

/// Token cancelled on Ctrl-C so long ingestion runs stop between chunks
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current chunk");
            child.cancel();
        }
    });
    token
}

fn print_batch_report(corpus: CorpusId, report: &BatchReport) {
    for document in &report.documents {
        println!(
            "{} {} ({} chunks{})",
            style("✓").green(),
            document.document_name,
            document.chunks_added,
            if document.chunks_skipped > 0 {
                format!(", {} excluded", document.chunks_skipped)
            } else {
                String::new()
            }
        );
    }
    for failure in &report.failures {
        println!(
            "{} {}: {}",
            style("✗").red(),
            failure.document_name,
            failure.error
        );
    }
    println!(
        "Added {} chunks to the {} corpus",
        style(report.chunks_added()).cyan(),
        corpus
    );
}

/// Ingest individual files into a corpus
pub async fn ingest_files(paths: &[PathBuf], corpus: CorpusId) -> Result<()> {
    let service = open_service().await?;
    let documents = paths
        .iter()
        .map(Document::from_path)
        .collect::<crate::Result<Vec<_>>>()?;

    info!("Ingesting {} documents into {}", documents.len(), corpus);
    let report = service
        .ingest_batch(corpus, documents, &cancel_on_interrupt())
        .await?;
    print_batch_report(corpus, &report);
    Ok(())
}

/// Ingest every supported file under a course material directory
pub async fn load_materials(dir: &Path, corpus: CorpusId) -> Result<()> {
    let service = open_service().await?;
    let report = service
        .load_directory(corpus, dir, &cancel_on_interrupt())
        .await?;
    print_batch_report(corpus, &report);
    Ok(())
}

pub async fn retrieve(query: &str, corpus: CorpusId, top_k: Option<usize>) -> Result<()> {
    let service = open_service().await?;
    let top_k = top_k.unwrap_or(service.top_k());
    let retrieval = service.retrieve_ranked(corpus, query, top_k).await;

    if retrieval.is_empty() {
        println!("{}", retrieval.texts().join("\n"));
        return Ok(());
    }

    println!("Found {} chunks ({} search):", retrieval.chunks.len(), retrieval.tier);
    println!();
    for (rank, hit) in retrieval.chunks.iter().enumerate() {
        println!(
            "{}. {} #{} (score {:.4})",
            rank + 1,
            style(&hit.chunk.document_name).cyan(),
            hit.chunk.ordinal,
            hit.score
        );
        println!("   {}", hit.chunk.text);
        println!();
    }
    Ok(())
}

/// Print a generation stream as plain text or as raw SSE frames
async fn print_stream(mut events: GenerationStream, sse: bool) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        if sse {
            write!(stdout, "{}", event.to_sse_frame())?;
        } else {
            match &event {
                GenerationEvent::Content(text) => write!(stdout, "{text}")?,
                GenerationEvent::Error(message) => {
                    writeln!(stdout)?;
                    eprintln!("{} {}", style("Error:").red().bold(), message);
                }
                GenerationEvent::Done => writeln!(stdout)?,
            }
        }
        stdout.flush()?;
    }
    Ok(())
}

pub async fn chat(message: &str, sse: bool) -> Result<()> {
    let service = open_service().await?;
    print_stream(service.chat(message, Vec::new()).await, sse).await
}

pub async fn flashcards(topic: &str, count: usize) -> Result<()> {
    let service = open_service().await?;
    let set = service.flashcards(topic, count).await?;
    println!("{}", serde_json::to_string_pretty(&set)?);
    Ok(())
}

pub async fn practice_exam(
    course: &str,
    exam_type: &str,
    difficulty: Option<Difficulty>,
    user_id: Option<&str>,
    sse: bool,
) -> Result<()> {
    let service = open_service().await?;
    let events = service
        .practice_exam(course, exam_type, difficulty, user_id)
        .await?;
    print_stream(events, sse).await
}

pub async fn submit_feedback(rating: &str, comment: &str, user_id: Option<&str>) -> Result<()> {
    let service = open_service().await?;
    let outcome = service.submit_feedback(rating, comment, user_id).await?;

    println!(
        "Recorded {} feedback (ID: {})",
        outcome.entry.rating, outcome.entry.id
    );
    if let Some(profile) = &outcome.profile {
        println!(
            "Difficulty preference for {}: {}",
            profile.user_id, profile.difficulty
        );
    }
    match &outcome.improvements {
        Some(improvements) => {
            println!();
            println!("{}", style("Improvements for the next generation:").bold());
            println!("{improvements}");
        }
        None => println!("No improvements generated."),
    }
    Ok(())
}

pub async fn show_status() -> Result<()> {
    let service = open_service().await?;
    let status = service.status().await?;

    println!("{}", style("Corpora").bold());
    for corpus in &status.corpora {
        println!(
            "  {:<8} {} chunks from {} documents",
            corpus.corpus, corpus.chunks, corpus.documents
        );
    }
    println!();
    println!("Cached embeddings: {}", status.cached_embeddings);
    println!();
    println!("{}", style("Feedback").bold());
    println!("  Total: {}", status.feedback.total);
    println!("  Good: {}", status.feedback.good);
    println!("  Bad: {}", status.feedback.bad);
    println!("  Improvement notes: {}", status.feedback.improvement_notes);
    println!("  Students: {}", status.feedback.students);
    Ok(())
}

/// Verify configuration, credentials and service reachability
pub async fn check_services() -> Result<()> {
    let config = load_config()?;
    config.validate().context("Configuration is invalid")?;
    println!("{} Configuration is valid", style("✓").green());

    let client = OpenAiClient::new(&config.service)?;
    println!(
        "{} API key found in {}",
        style("✓").green(),
        config.service.api_key_env
    );

    let base_url = client.base_url().to_string();
    tokio::task::spawn_blocking(move || client.health_check())
        .await
        .context("Health check task failed")??;
    println!("{} Service reachable at {}", style("✓").green(), base_url);

    for tool in ["pdftotext", "pdftoppm", "tesseract"] {
        match which(tool) {
            Some(path) => println!("{} {} at {}", style("✓").green(), tool, path.display()),
            None => println!(
                "{} {} not found; PDF ingestion may be limited",
                style("!").yellow(),
                tool
            ),
        }
    }
    Ok(())
}

fn which(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}
