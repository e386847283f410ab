// ABOUTME: Session spec entries produced from agent output
// ABOUTME: Decisions, questions, assumptions and the inferred session status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: String,
    pub topic: String,
    pub choice: String,
    pub rationale: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Open,
    Answered,
    Skipped,
}

/// How a question was found in the output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionSource {
    Marker,
    Natural,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub options: Vec<String>,
    pub suggestion: Option<String>,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub source: QuestionSource,
    pub auto_answered: bool,
    pub timestamp: DateTime<Utc>,
}

impl Question {
    pub fn is_open(&self) -> bool {
        self.status == QuestionStatus::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assumption {
    pub id: String,
    pub text: String,
    pub flagged: bool,
    pub correction: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Working,
    Waiting,
    Done,
}

/// What to do with a newly extracted question
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Surface,
    AutoAnswer,
    Skip,
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
