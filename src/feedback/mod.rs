// Feedback loop
// Ratings, student difficulty preferences and self-critique improvement notes


use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::database::{
    Database, Difficulty, FeedbackEntry, FeedbackStatistics, NewFeedbackEntry, Rating,
    StudentProfile,
};
use crate::generation::GenerationOrchestrator;
use crate::{Result, StudyError};

/// What a feedback submission produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackOutcome {
    pub entry: FeedbackEntry,
    /// Self-critique of the last artifact, only for negative ratings
    pub improvements: Option<String>,
    pub profile: Option<StudentProfile>,
}

#[derive(Debug, Clone)]
pub struct FeedbackLoop {
    database: Database,
    orchestrator: GenerationOrchestrator,
    /// Serializes profile read-modify-write sequences
    update_lock: Arc<Mutex<()>>,
    last_artifact: Arc<RwLock<Option<String>>>,
}

impl FeedbackLoop {
    pub fn new(database: Database, orchestrator: GenerationOrchestrator) -> Self {
        Self {
            database,
            orchestrator,
            update_lock: Arc::new(Mutex::new(())),
            last_artifact: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember `content` as the artifact negative feedback will critique
    pub async fn record_artifact(&self, kind: &str, content: &str) -> Result<()> {
        *self.last_artifact.write().await = Some(content.to_string());
        self.database
            .store_artifact(kind, content)
            .await
            .map_err(StudyError::database)?;
        debug!("Recorded {} artifact ({} characters)", kind, content.len());
        Ok(())
    }

    /// Most recent artifact from this process, else the last one persisted
    pub async fn last_artifact(&self) -> Result<Option<String>> {
        if let Some(artifact) = self.last_artifact.read().await.clone() {
            return Ok(Some(artifact));
        }
        let stored = self
            .database
            .latest_artifact()
            .await
            .map_err(StudyError::database)?;
        Ok(stored.map(|a| a.content))
    }

    /// Record a rating and, for a bad one, critique the last artifact.
    ///
    /// Every call stores a new entry; identical submissions are not merged.
    pub async fn submit_feedback(
        &self,
        rating: &str,
        comment: &str,
        user_id: Option<&str>,
    ) -> Result<FeedbackOutcome> {
        let rating: Rating = rating.parse()?;
        let user_id = user_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let entry = NewFeedbackEntry {
            rating,
            comment: comment.to_string(),
            user_id,
        };
        let difficulty = Difficulty::from_comment(comment);

        let (entry, profile) = {
            let _guard = self.update_lock.lock().await;
            self.database
                .record_feedback(&entry, difficulty)
                .await
                .map_err(StudyError::database)?
        };
        info!(
            "Recorded {} feedback #{} (difficulty change: {:?})",
            entry.rating, entry.id, difficulty
        );

        let improvements = match rating {
            Rating::Good => None,
            Rating::Bad => self.critique(entry.id).await?,
        };

        Ok(FeedbackOutcome {
            entry,
            improvements,
            profile,
        })
    }

    async fn critique(&self, feedback_id: i64) -> Result<Option<String>> {
        let Some(artifact) = self.last_artifact().await? else {
            info!("No generated artifact to critique");
            return Ok(None);
        };

        info!("Running self-critique for feedback #{}", feedback_id);
        let critique = match self.orchestrator.self_critique(&artifact).await {
            Ok(critique) => critique,
            Err(e) => {
                warn!("Self-critique failed, feedback kept without notes: {}", e);
                return Ok(None);
            }
        };

        self.database
            .add_improvement_note(Some(feedback_id), &critique)
            .await
            .map_err(StudyError::database)?;
        Ok(Some(critique))
    }

    /// All improvement notes, oldest first
    pub async fn improvement_notes(&self) -> Result<Vec<String>> {
        let notes = self
            .database
            .list_improvement_notes()
            .await
            .map_err(StudyError::database)?;
        Ok(notes.into_iter().map(|n| n.content).collect())
    }

    pub async fn statistics(&self) -> Result<FeedbackStatistics> {
        self.database
            .feedback_statistics()
            .await
            .map_err(StudyError::database)
    }

    pub async fn profile(&self, user_id: &str) -> Result<Option<StudentProfile>> {
        self.database
            .get_profile(user_id)
            .await
            .map_err(StudyError::database)
    }

    /// Stored preference, `Medium` for unknown students
    pub async fn difficulty_for(&self, user_id: Option<&str>) -> Result<Difficulty> {
        let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(Difficulty::default());
        };
        Ok(self
            .profile(user_id)
            .await?
            .map(|p| p.difficulty)
            .unwrap_or_default())
    }
}
