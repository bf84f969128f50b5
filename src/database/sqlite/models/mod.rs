
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use std::str::FromStr;

use crate::StudyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Good,
    Bad,
}

impl Rating {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Good => "good",
            Rating::Bad => "bad",
        }
    }
}

impl std::fmt::Display for Rating {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rating {
    type Err = StudyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "good" => Ok(Rating::Good),
            "bad" => Ok(Rating::Bad),
            other => Err(StudyError::Validation(format!(
                "rating must be 'good' or 'bad', got '{other}'"
            ))),
        }
    }
}

/// A student's preferred exam difficulty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    /// Preference implied by a feedback comment, if any.
    ///
    /// "too easy" asks for hard questions, "too hard" for easy ones.
    pub fn from_comment(comment: &str) -> Option<Self> {
        let comment = comment.to_lowercase();
        if comment.contains("too easy") {
            Some(Difficulty::Hard)
        } else if comment.contains("too hard") {
            Some(Difficulty::Easy)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Difficulty {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Difficulty::Easy => write!(f, "Easy"),
            Difficulty::Medium => write!(f, "Medium"),
            Difficulty::Hard => write!(f, "Hard"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = StudyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(StudyError::Validation(format!(
                "difficulty must be easy, medium or hard, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct FeedbackEntry {
    pub id: i64,
    pub rating: Rating,
    pub comment: String,
    pub user_id: Option<String>,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeedbackEntry {
    pub rating: Rating,
    pub comment: String,
    pub user_id: Option<String>,
}

impl NewFeedbackEntry {
    /// Line appended to the student's feedback history
    #[inline]
    pub fn profile_line(&self) -> String {
        format!("Rating: {}, Comments: {}", self.rating, self.comment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ImprovementNote {
    pub id: i64,
    pub feedback_id: Option<i64>,
    pub content: String,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StudentProfileRow {
    pub user_id: String,
    pub difficulty: Difficulty,
    pub updated_date: NaiveDateTime,
}

/// Difficulty preference plus the student's accumulated feedback lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub user_id: String,
    pub difficulty: Difficulty,
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct GeneratedArtifact {
    pub id: i64,
    pub kind: String,
    pub content: String,
    pub created_date: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedbackStatistics {
    pub total: i64,
    pub good: i64,
    pub bad: i64,
    pub improvement_notes: i64,
    pub students: i64,
}
