// ABOUTME: Session orchestration over the sandbox fleet
// ABOUTME: Poll loop, session connector seam, auto-answer, event stream and job dispatch

pub mod autoanswer;
pub mod connector;
pub mod dispatcher;
pub mod events;
pub mod orchestrator;


use fleet_conversations::{ClientError, PipelineError};
use fleet_extraction::ExtractionError;
use fleet_sandbox::ManagerError;
use fleet_storage::StorageError;
use thiserror::Error;

pub use connector::{ConversationConnector, LiveSession, SessionConnector};
pub use dispatcher::JobDispatcher;
pub use events::OrchestratorEvent;
pub use orchestrator::{Orchestrator, OrchestratorSettings, TickReport};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session has no running sandbox: {0}")]
    SandboxUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] ManagerError),

    #[error("Sandbox transport error: {0}")]
    Transport(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
