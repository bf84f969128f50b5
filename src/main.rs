use anyhow::Result;
use clap::{Parser, Subcommand};
use medbot::commands::{
    chat, check_services, flashcards, ingest_files, load_materials, practice_exam, retrieve,
    show_status, submit_feedback,
};
use medbot::config::{init_config, show_config};
use medbot::database::Difficulty;
use medbot::index::CorpusId;
use medbot::pipeline::DEFAULT_FLASHCARD_COUNT;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "medbot")]
#[command(about = "Course material retrieval, tutoring and practice exams for medical students")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or initialize the configuration file
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Write a default configuration file
        #[arg(long, conflicts_with = "show")]
        init: bool,
    },
    /// Ingest text or PDF documents into a corpus
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Corpus to ingest into: course, exams or uploads
        #[arg(long, default_value = "course")]
        corpus: CorpusId,
    },
    /// Ingest every text and PDF file under a directory
    Load {
        /// Course material directory (created if missing)
        dir: PathBuf,
        #[arg(long, default_value = "course")]
        corpus: CorpusId,
    },
    /// Show the context chunks retrieved for a query
    Retrieve {
        query: String,
        #[arg(long, default_value = "course")]
        corpus: CorpusId,
        /// Number of chunks to return (defaults to the configured top_k)
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Ask the medical tutor a question
    Chat {
        message: String,
        /// Print raw server-sent event frames
        #[arg(long)]
        sse: bool,
    },
    /// Generate flashcards about a topic
    Flashcards {
        topic: String,
        #[arg(long, default_value_t = DEFAULT_FLASHCARD_COUNT)]
        count: usize,
    },
    /// Generate a practice exam for a course
    Exam {
        course: String,
        /// Kind of exam, e.g. "Midterm" or "Final"
        #[arg(long, default_value = "Midterm")]
        exam_type: String,
        /// easy, medium or hard (defaults to the student's preference)
        #[arg(long)]
        difficulty: Option<Difficulty>,
        /// Student whose difficulty preference applies
        #[arg(long)]
        user: Option<String>,
        /// Print raw server-sent event frames
        #[arg(long)]
        sse: bool,
    },
    /// Rate the last generated exam or flashcards
    Feedback {
        /// good or bad
        rating: String,
        #[arg(long, default_value = "")]
        comment: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Show corpus sizes and feedback totals
    Status,
    /// Check configuration, API key, service reachability and PDF tools
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show, init } => {
            if init {
                init_config()?;
            } else if show {
                show_config()?;
            } else {
                show_config()?;
                eprintln!();
                eprintln!("Edit the file above, or run 'medbot config --init' to create it.");
            }
        }
        Commands::Ingest { paths, corpus } => {
            ingest_files(&paths, corpus).await?;
        }
        Commands::Load { dir, corpus } => {
            load_materials(&dir, corpus).await?;
        }
        Commands::Retrieve {
            query,
            corpus,
            top_k,
        } => {
            retrieve(&query, corpus, top_k).await?;
        }
        Commands::Chat { message, sse } => {
            chat(&message, sse).await?;
        }
        Commands::Flashcards { topic, count } => {
            flashcards(&topic, count).await?;
        }
        Commands::Exam {
            course,
            exam_type,
            difficulty,
            user,
            sse,
        } => {
            practice_exam(&course, &exam_type, difficulty, user.as_deref(), sse).await?;
        }
        Commands::Feedback {
            rating,
            comment,
            user,
        } => {
            submit_feedback(&rating, &comment, user.as_deref()).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Check => {
            check_services().await?;
        }
    }

    Ok(())
}
