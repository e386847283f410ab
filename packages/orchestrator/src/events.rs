// ABOUTME: Events the orchestrator publishes to whoever is watching sessions
// ABOUTME: Discovery, loss, spec changes and question routing outcomes

use fleet_extraction::{Question, SpecUpdate};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    SessionDiscovered {
        session_id: String,
    },
    SessionLost {
        session_id: String,
    },
    SpecUpdated {
        session_id: String,
        update: SpecUpdate,
    },
    /// Needs an operator answer
    QuestionSurfaced {
        session_id: String,
        question: Question,
    },
    QuestionAutoAnswered {
        session_id: String,
        question: Question,
    },
}

impl OrchestratorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionDiscovered { session_id }
            | Self::SessionLost { session_id }
            | Self::SpecUpdated { session_id, .. }
            | Self::QuestionSurfaced { session_id, .. }
            | Self::QuestionAutoAnswered { session_id, .. } => session_id,
        }
    }
}
