// ABOUTME: Turns streamed agent text into decisions, questions, assumptions and focus
// ABOUTME: Pure parsing and classification, no I/O

pub mod classify;
pub mod dedup;
pub mod natural;
pub mod parser;
pub mod spec;
pub mod status;
pub mod types;

use thiserror::Error;

pub use classify::{classify, search_term};
pub use spec::{extract, Extracted, ExtractedDecision, ExtractedQuestion, SessionSpec, SpecUpdate};
pub use status::infer_status;
pub use types::{
    Assumption, Classification, Decision, Question, QuestionSource, QuestionStatus, SessionStatus,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Question not found: {0}")]
    QuestionNotFound(String),

    #[error("Question is no longer open: {0}")]
    QuestionNotOpen(String),

    #[error("Assumption not found: {0}")]
    AssumptionNotFound(String),

    #[error("Decision not found: {0}")]
    DecisionNotFound(String),
}

pub type Result<T> = std::result::Result<T, ExtractionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionSettings {
    /// Leading normalized characters compared when deduplicating
    pub dedup_prefix: usize,
    pub max_natural_questions: usize,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            dedup_prefix: dedup::DEFAULT_DEDUP_PREFIX,
            max_natural_questions: natural::MAX_NATURAL_QUESTIONS,
        }
    }
}
