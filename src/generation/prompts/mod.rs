
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::database::Difficulty;

/// Separator placed between retrieved context chunks
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Reference exam used when no stored exam is long enough to imitate.
pub const DEFAULT_EXAM_REFERENCE: &str = "\
Medical Exam

Question 1: What is the primary function of the mitochondria?
A) Protein synthesis
B) Cellular respiration
C) DNA replication
D) Cell division

Answer: B
Explanation: Mitochondria are known as the powerhouse of the cell and are responsible for cellular respiration, which produces ATP, the energy currency of the cell.

Question 2: Which of the following is NOT a component of the limbic system?
A) Amygdala
B) Hippocampus
C) Cerebellum
D) Hypothalamus

Answer: C
Explanation: The cerebellum is not part of the limbic system. It is responsible for motor control and coordination.
";

/// References shorter than this are replaced by [`DEFAULT_EXAM_REFERENCE`]
pub const MIN_EXAM_REFERENCE_CHARS: usize = 100;

/// What a generation call is for. Each task carries its own role framing
/// and formatting rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskContext {
    Chat {
        question: String,
    },
    Flashcards {
        count: usize,
    },
    PracticeExam {
        course: String,
        exam_type: String,
        difficulty: Difficulty,
    },
    SelfCritique {
        artifact: String,
    },
}

impl TaskContext {
    /// Short name used in logs and for stored artifacts
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat { .. } => "chat",
            Self::Flashcards { .. } => "flashcards",
            Self::PracticeExam { .. } => "practice_exam",
            Self::SelfCritique { .. } => "self_critique",
        }
    }

    /// Whether accumulated improvement notes are folded into this task's prompt
    #[inline]
    pub fn uses_improvement_notes(&self) -> bool {
        !matches!(self, Self::SelfCritique { .. })
    }
}

pub fn join_context(chunks: &[String]) -> String {
    chunks
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .join(CONTEXT_SEPARATOR)
}

/// Pick the reference exam text, falling back to the built-in template.
pub fn exam_reference(retrieved: Option<&str>) -> &str {
    match retrieved {
        Some(text) if text.trim().chars().count() >= MIN_EXAM_REFERENCE_CHARS => text,
        _ => DEFAULT_EXAM_REFERENCE,
    }
}

pub fn system_prompt(task: &TaskContext, context: &str, improvement_notes: &[String]) -> String {
    let mut prompt = match task {
        TaskContext::Chat { .. } => chat_system_prompt(context),
        TaskContext::Flashcards { .. } => {
            "You are an expert educational content creator.".to_string()
        }
        TaskContext::PracticeExam {
            exam_type,
            difficulty,
            ..
        } => exam_system_prompt(context, exam_type, *difficulty),
        TaskContext::SelfCritique { .. } => {
            "You are an AI specialized in refining university exams.".to_string()
        }
    };

    if task.uses_improvement_notes() && !improvement_notes.is_empty() {
        prompt.push_str("\n\nApply these improvements learned from earlier feedback:\n");
        prompt.push_str(&improvement_notes.iter().map(|n| n.trim()).join("\n"));
    }

    prompt
}

/// The final user turn of the conversation
pub fn user_prompt(task: &TaskContext, context: &str) -> String {
    match task {
        TaskContext::Chat { question } => question.clone(),
        TaskContext::Flashcards { count } => flashcards_user_prompt(context, *count),
        TaskContext::PracticeExam {
            course, difficulty, ..
        } => format!(
            "TASK:\n\
             - Create a challenging exam for the course '{course}' at {} difficulty\n\
             - Each question must follow the exact format:\n  \
             Question X: [Question text]\n  \
             A) [Option text]\n  \
             B) [Option text]\n  \
             C) [Option text]\n  \
             D) [Option text]\n\
             - Ensure questions are challenging and test deep understanding\n\
             - Output only the final exam text with proper question numbering\n",
            difficulty.as_str()
        ),
        TaskContext::SelfCritique { artifact } => format!(
            "The following exam was marked as unsatisfactory. Provide 3 improvements:\n\
             - question variety\n\
             - depth of challenge\n\
             - formatting or clarity\n\
             -------------------\n\
             {artifact}\n\
             -------------------\n"
        ),
    }
}

fn chat_system_prompt(context: &str) -> String {
    if context.trim().is_empty() {
        "You are a medical AI assistant. Provide accurate, helpful medical information while \
         being clear about your limitations and encouraging users to consult healthcare \
         professionals for specific medical advice."
            .to_string()
    } else {
        format!(
            "You are a medical AI assistant. Use the following context to help answer the \
             question, but don't mention that you're using this context:\n\n{context}"
        )
    }
}

fn exam_system_prompt(reference: &str, exam_type: &str, difficulty: Difficulty) -> String {
    format!(
        "You are an advanced AI exam generator.\n\
         Your goals:\n\
         1. Create multiple choice questions with exactly 4 options labeled as A), B), C), D)\n\
         2. Each question must start with \"Question X:\" where X is the question number\n\
         3. The exam type is {exam_type}, and difficulty is {}\n\
         4. Each question must have:\n   \
         - A clear question text\n   \
         - Four options labeled as A), B), C), D)\n   \
         - Each option on a new line\n\
         5. Match the style, structure and complexity of the reference exam below with new questions\n\
         6. Do NOT include answers or explanations\n\
         7. Do NOT reveal chain-of-thought; output only the final exam text\n\n\
         Reference exam:\n{reference}",
        difficulty.as_str()
    )
}

fn flashcards_user_prompt(context: &str, count: usize) -> String {
    format!(
        "Below is some course material extracted from a textbook:\n\n\
         {context}\n\n\
         Based ONLY on the above reference material, generate {count} high-quality flashcards in JSON format.\n\
         Each flashcard should:\n\
         1. Focus on a key concept, definition, or relationship from the material\n\
         2. Include a \"question\" field that is clear and specific\n\
         3. Include an \"answer\" field that is concise yet comprehensive\n\
         4. Be directly relevant to the provided context (don't make up information)\n\
         5. Vary between different question types (multiple-choice, fill-in-the-blank, true/false, open-ended)\n\
         6. Progress from simpler to more complex concepts\n\n\
         For multiple-choice questions, include options in the question field and the correct answer in the answer field.\n\n\
         Return ONLY a JSON array of flashcard objects with no additional text or explanation.\n\
         Each object should have exactly two fields: \"question\" and \"answer\"."
    )
}
