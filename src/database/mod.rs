// Database module
// SQLite storage for feedback, improvement notes, student profiles and generated artifacts

pub mod sqlite;

pub use sqlite::models::{
    Difficulty, FeedbackEntry, FeedbackStatistics, GeneratedArtifact, ImprovementNote,
    NewFeedbackEntry, Rating, StudentProfile,
};
pub use sqlite::{Database, DbPool};
