use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use tracing::{debug, info};

use crate::database::sqlite::models::{
    Difficulty, FeedbackEntry, FeedbackStatistics, GeneratedArtifact, ImprovementNote,
    NewFeedbackEntry, StudentProfile,
};
use crate::database::sqlite::queries::{
    ArtifactQueries, FeedbackQueries, ImprovementNoteQueries, ProfileQueries,
};


pub mod models;
pub mod queries;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to create database connection pool")?;

        let database = Self { pool };
        database.run_migrations().await?;

        Ok(database)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("src/database/sqlite/migrations")
            .run(&self.pool)
            .await
            .context("Failed to run schema migration")?;

        debug!("Database migrations completed successfully");
        Ok(())
    }

    pub async fn initialize_from_config_dir(config_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        Self::new(config_dir.join("medbot.db")).await
    }

    /// Store a feedback entry and, when it names a student, fold it into
    /// their profile. Everything commits together or not at all.
    pub async fn record_feedback(
        &self,
        entry: &NewFeedbackEntry,
        difficulty: Option<Difficulty>,
    ) -> Result<(FeedbackEntry, Option<StudentProfile>)> {
        let now = Utc::now().naive_utc();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin feedback transaction")?;

        let created = FeedbackQueries::create(&mut tx, entry, now).await?;

        let profile = match entry.user_id.as_deref() {
            Some(user_id) => {
                ProfileQueries::ensure(&mut tx, user_id, now).await?;
                if let Some(difficulty) = difficulty {
                    ProfileQueries::set_difficulty(&mut tx, user_id, difficulty, now).await?;
                }
                ProfileQueries::append_feedback(&mut tx, user_id, &entry.profile_line(), now)
                    .await?;
                ProfileQueries::get(&mut tx, user_id).await?
            }
            None => None,
        };

        tx.commit()
            .await
            .context("Failed to commit feedback transaction")?;

        Ok((created, profile))
    }

    // Profile operations
    pub async fn get_profile(&self, user_id: &str) -> Result<Option<StudentProfile>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        ProfileQueries::get(&mut conn, user_id).await
    }

    // Improvement note operations
    pub async fn add_improvement_note(
        &self,
        feedback_id: Option<i64>,
        content: &str,
    ) -> Result<ImprovementNote> {
        ImprovementNoteQueries::create(&self.pool, feedback_id, content, Utc::now().naive_utc())
            .await
    }

    pub async fn list_improvement_notes(&self) -> Result<Vec<ImprovementNote>> {
        ImprovementNoteQueries::list_all(&self.pool).await
    }

    // Artifact operations
    pub async fn store_artifact(&self, kind: &str, content: &str) -> Result<GeneratedArtifact> {
        ArtifactQueries::create(&self.pool, kind, content, Utc::now().naive_utc()).await
    }

    pub async fn latest_artifact(&self) -> Result<Option<GeneratedArtifact>> {
        ArtifactQueries::latest(&self.pool).await
    }

    pub async fn feedback_statistics(&self) -> Result<FeedbackStatistics> {
        FeedbackQueries::statistics(&self.pool).await
    }

    pub async fn recent_feedback(&self, limit: i64) -> Result<Vec<FeedbackEntry>> {
        FeedbackQueries::list_recent(&self.pool, limit).await
    }
}
