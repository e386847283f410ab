// ABOUTME: Seam between the poll loop and wherever live agent sessions come from
// ABOUTME: Default implementation reads conversations and their assistant output from storage

use crate::{OrchestratorError, Result};
use async_trait::async_trait;
use fleet_conversations::{
    AuthContext, ContentBlock, DeliveryPipeline, ExecRequest, ExecResult, Identity, MessageRole,
};
use fleet_sandbox::SandboxStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveSession {
    pub id: String,
    pub team_id: String,
    pub cwd: String,
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Sessions that currently have a running agent
    async fn list_sessions(&self) -> Result<Vec<LiveSession>>;

    /// Output produced since the previous pull, or an empty string
    async fn pull_output(&self, session: &LiveSession) -> Result<String>;

    /// Send text back into the session. Repeating `client_key` is a no-op.
    async fn inject(&self, session: &LiveSession, text: &str, client_key: &str) -> Result<()>;

    async fn exec(&self, session: &LiveSession, request: &ExecRequest) -> Result<ExecResult>;

    /// Drop any per-session read state
    async fn forget(&self, _session_id: &str) {}
}

/// Read position in a session's assistant messages
#[derive(Debug, Default)]
struct Cursor {
    seq: i64,
    /// The last message pulled did not end its line
    open_line: bool,
}

/// Sessions are non-closed conversations whose sandbox is running
pub struct ConversationConnector {
    pipeline: Arc<DeliveryPipeline>,
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl ConversationConnector {
    pub fn new(pipeline: Arc<DeliveryPipeline>) -> Self {
        Self {
            pipeline,
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl SessionConnector for ConversationConnector {
    async fn list_sessions(&self) -> Result<Vec<LiveSession>> {
        let conversations = self.pipeline.store().list_open_conversations().await?;
        let mut live = Vec::new();

        for conversation in conversations {
            let Some(sandbox_id) = conversation.sandbox_id.as_deref() else {
                continue;
            };
            let running = self
                .pipeline
                .sandboxes()
                .get(sandbox_id)
                .await?
                .is_some_and(|s| s.status == SandboxStatus::Running);
            if running {
                live.push(LiveSession {
                    id: conversation.id,
                    team_id: conversation.team_id,
                    cwd: conversation.cwd,
                });
            }
        }

        Ok(live)
    }

    async fn pull_output(&self, session: &LiveSession) -> Result<String> {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(session.id.clone()).or_default();

        let messages = self
            .pipeline
            .store()
            .messages_after(&session.id, MessageRole::Assistant, cursor.seq)
            .await?;

        let mut output = String::new();
        for message in &messages {
            let text = message.text();
            if text.is_empty() {
                cursor.seq = message.seq;
                continue;
            }
            // Each message ends the previous one's line
            if cursor.open_line {
                output.push('\n');
            }
            output.push_str(&text);
            cursor.open_line = !text.ends_with('\n');
            cursor.seq = message.seq;
        }

        if !messages.is_empty() {
            debug!(session_id = %session.id, messages = messages.len(), "Pulled agent output");
        }
        Ok(output)
    }

    async fn inject(&self, session: &LiveSession, text: &str, client_key: &str) -> Result<()> {
        let auth = AuthContext::from(Identity::service(session.team_id.clone()));
        self.pipeline
            .send_message(&auth, &session.id, vec![ContentBlock::text(text)], client_key)
            .await?;
        Ok(())
    }

    async fn exec(&self, session: &LiveSession, request: &ExecRequest) -> Result<ExecResult> {
        let conversation = self
            .pipeline
            .store()
            .find_conversation(&session.id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session.id.clone()))?;

        let endpoint = self
            .pipeline
            .conversation_endpoint(&conversation)
            .await?
            .ok_or_else(|| OrchestratorError::SandboxUnavailable(session.id.clone()))?;

        Ok(self.pipeline.transport().exec(&endpoint, request).await?)
    }

    async fn forget(&self, session_id: &str) {
        self.cursors.lock().await.remove(session_id);
    }
}
