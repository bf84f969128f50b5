
use super::models::*;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

pub struct FeedbackQueries;

impl FeedbackQueries {
    #[inline]
    pub async fn create(
        conn: &mut SqliteConnection,
        entry: &NewFeedbackEntry,
        now: NaiveDateTime,
    ) -> Result<FeedbackEntry> {
        let created = sqlx::query_as::<_, FeedbackEntry>(
            r#"
            INSERT INTO feedback_entries (rating, comment, user_id, created_date)
            VALUES (?, ?, ?, ?)
            RETURNING id, rating, comment, user_id, created_date
            "#,
        )
        .bind(entry.rating)
        .bind(&entry.comment)
        .bind(&entry.user_id)
        .bind(now)
        .fetch_one(conn)
        .await
        .context("Failed to create feedback entry")?;

        debug!("Recorded {} feedback entry {}", created.rating, created.id);
        Ok(created)
    }

    #[inline]
    pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<FeedbackEntry>> {
        let entries = sqlx::query_as::<_, FeedbackEntry>(
            r#"
            SELECT id, rating, comment, user_id, created_date
            FROM feedback_entries ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list feedback entries")?;

        Ok(entries)
    }

    #[inline]
    pub async fn statistics(pool: &SqlitePool) -> Result<FeedbackStatistics> {
        let (total, good, bad): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN rating = 'good' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN rating = 'bad' THEN 1 ELSE 0 END), 0)
            FROM feedback_entries
            "#,
        )
        .fetch_one(pool)
        .await
        .context("Failed to count feedback entries")?;

        let improvement_notes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM improvement_notes")
            .fetch_one(pool)
            .await
            .context("Failed to count improvement notes")?;

        let students: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM student_profiles")
            .fetch_one(pool)
            .await
            .context("Failed to count student profiles")?;

        Ok(FeedbackStatistics {
            total,
            good,
            bad,
            improvement_notes,
            students,
        })
    }
}

pub struct ImprovementNoteQueries;

impl ImprovementNoteQueries {
    #[inline]
    pub async fn create(
        pool: &SqlitePool,
        feedback_id: Option<i64>,
        content: &str,
        now: NaiveDateTime,
    ) -> Result<ImprovementNote> {
        let note = sqlx::query_as::<_, ImprovementNote>(
            r#"
            INSERT INTO improvement_notes (feedback_id, content, created_date)
            VALUES (?, ?, ?)
            RETURNING id, feedback_id, content, created_date
            "#,
        )
        .bind(feedback_id)
        .bind(content)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to create improvement note")?;

        Ok(note)
    }

    /// Every note, oldest first
    #[inline]
    pub async fn list_all(pool: &SqlitePool) -> Result<Vec<ImprovementNote>> {
        let notes = sqlx::query_as::<_, ImprovementNote>(
            "SELECT id, feedback_id, content, created_date FROM improvement_notes ORDER BY id ASC",
        )
        .fetch_all(pool)
        .await
        .context("Failed to list improvement notes")?;

        Ok(notes)
    }
}

pub struct ProfileQueries;

impl ProfileQueries {
    /// Create the profile at the default difficulty if it does not exist yet
    #[inline]
    pub async fn ensure(
        conn: &mut SqliteConnection,
        user_id: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO student_profiles (user_id, difficulty, updated_date)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Difficulty::default())
        .bind(now)
        .execute(conn)
        .await
        .with_context(|| format!("Failed to create profile for {user_id}"))?;

        Ok(())
    }

    #[inline]
    pub async fn set_difficulty(
        conn: &mut SqliteConnection,
        user_id: &str,
        difficulty: Difficulty,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query("UPDATE student_profiles SET difficulty = ?, updated_date = ? WHERE user_id = ?")
            .bind(difficulty)
            .bind(now)
            .bind(user_id)
            .execute(conn)
            .await
            .with_context(|| format!("Failed to update difficulty for {user_id}"))?;

        Ok(())
    }

    #[inline]
    pub async fn append_feedback(
        conn: &mut SqliteConnection,
        user_id: &str,
        line: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query("INSERT INTO student_feedback (user_id, line, created_date) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(line)
            .bind(now)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to append feedback for {user_id}"))?;

        sqlx::query("UPDATE student_profiles SET updated_date = ? WHERE user_id = ?")
            .bind(now)
            .bind(user_id)
            .execute(conn)
            .await
            .with_context(|| format!("Failed to touch profile for {user_id}"))?;

        Ok(())
    }

    #[inline]
    pub async fn get(conn: &mut SqliteConnection, user_id: &str) -> Result<Option<StudentProfile>> {
        let row = sqlx::query_as::<_, StudentProfileRow>(
            "SELECT user_id, difficulty, updated_date FROM student_profiles WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to get profile for {user_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let feedback: Vec<String> = sqlx::query_scalar(
            "SELECT line FROM student_feedback WHERE user_id = ? ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(conn)
        .await
        .with_context(|| format!("Failed to list feedback for {user_id}"))?;

        Ok(Some(StudentProfile {
            user_id: row.user_id,
            difficulty: row.difficulty,
            feedback,
        }))
    }
}

pub struct ArtifactQueries;

impl ArtifactQueries {
    #[inline]
    pub async fn create(
        pool: &SqlitePool,
        kind: &str,
        content: &str,
        now: NaiveDateTime,
    ) -> Result<GeneratedArtifact> {
        let artifact = sqlx::query_as::<_, GeneratedArtifact>(
            r#"
            INSERT INTO generated_artifacts (kind, content, created_date)
            VALUES (?, ?, ?)
            RETURNING id, kind, content, created_date
            "#,
        )
        .bind(kind)
        .bind(content)
        .bind(now)
        .fetch_one(pool)
        .await
        .context("Failed to store generated artifact")?;

        Ok(artifact)
    }

    #[inline]
    pub async fn latest(pool: &SqlitePool) -> Result<Option<GeneratedArtifact>> {
        let artifact = sqlx::query_as::<_, GeneratedArtifact>(
            r#"
            SELECT id, kind, content, created_date
            FROM generated_artifacts ORDER BY id DESC LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await
        .context("Failed to get latest artifact")?;

        Ok(artifact)
    }
}
