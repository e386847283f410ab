// ABOUTME: Conversation and delivery pipeline binding conversations to sandboxes
// ABOUTME: Idempotent conversation/message creation and scheduled, retrying, at-least-once delivery

use crate::client::{
    ClientError, InitRequest, PromptRequest, SandboxEndpoint, SandboxTransport,
};
use crate::identity::{AuthContext, Identity};
use crate::store::{ConversationStore, NewConversation};
use crate::types::{
    ContentBlock, Conversation, ConversationStatus, DeliveryStatus, Message, MessageRole,
};
use fleet_sandbox::{ManagerError, Sandbox, SandboxManager, SandboxStatus};
use fleet_storage::{ScheduledJob, Scheduler, StorageError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Conversation is closed: {0}")]
    ConversationClosed(String),

    #[error("Sandbox unavailable for conversation {0}")]
    SandboxUnavailable(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] ManagerError),

    #[error("Sandbox transport error: {0}")]
    Transport(#[from] ClientError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomised in either direction
    pub jitter: f64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl DeliverySettings {
    /// Un-jittered delay before attempt `attempt + 1`: base * 2^(attempt-1), capped
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return nominal;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        nominal.mul_f64(factor)
    }
}

#[derive(Debug, Clone)]
pub struct StartConversationRequest {
    pub agent_provider: String,
    pub cwd: String,
    pub client_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Ready,
    Initializing,
}

#[derive(Debug, Clone)]
pub struct StartedConversation {
    pub conversation: Conversation,
    pub status: StartStatus,
    /// False when an existing conversation was returned for the key
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Conversation or message gone, or the message already reached a final state
    Skipped,
    Delivered,
    Rescheduled { next_attempt: u32, delay: Duration },
    /// An earlier message of the conversation goes first; same attempt, later
    Deferred { delay: Duration },
    Failed,
}

pub struct DeliveryPipeline {
    store: ConversationStore,
    sandboxes: Arc<SandboxManager>,
    transport: Arc<dyn SandboxTransport>,
    scheduler: Arc<dyn Scheduler>,
    settings: DeliverySettings,
}

fn endpoint(sandbox: &Sandbox) -> Option<SandboxEndpoint> {
    if sandbox.status != SandboxStatus::Running {
        return None;
    }
    sandbox.sandbox_url.as_ref().map(|url| SandboxEndpoint {
        sandbox_id: sandbox.id.clone(),
        base_url: url.clone(),
    })
}

impl DeliveryPipeline {
    pub fn new(
        store: ConversationStore,
        sandboxes: Arc<SandboxManager>,
        transport: Arc<dyn SandboxTransport>,
        scheduler: Arc<dyn Scheduler>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            store,
            sandboxes,
            transport,
            scheduler,
            settings,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn sandboxes(&self) -> &Arc<SandboxManager> {
        &self.sandboxes
    }

    pub fn transport(&self) -> &Arc<dyn SandboxTransport> {
        &self.transport
    }

    /// Conversation visible to `identity`; other teams' conversations read as missing
    async fn owned_conversation(
        &self,
        identity: &Identity,
        conversation_id: &str,
    ) -> Result<Conversation> {
        self.store
            .find_conversation(conversation_id)
            .await?
            .filter(|c| c.team_id == identity.team_id)
            .ok_or_else(|| PipelineError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Running sandbox endpoint for a conversation, if it has one
    pub async fn conversation_endpoint(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<SandboxEndpoint>> {
        let Some(sandbox_id) = conversation.sandbox_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .sandboxes
            .get(sandbox_id)
            .await?
            .as_ref()
            .and_then(endpoint))
    }

    /// Warm sandbox if the team has one, otherwise a fresh spawn
    async fn acquire_sandbox(&self, team_id: &str) -> Result<Sandbox> {
        if let Some(sandbox) = self.sandboxes.claim_warm(team_id).await? {
            return Ok(sandbox);
        }
        Ok(self.sandboxes.spawn(team_id).await?)
    }

    /// Acquire a sandbox and count one conversation against it
    async fn acquire_attached(&self, team_id: &str, subject: &str) -> Result<Sandbox> {
        let sandbox = self.acquire_sandbox(team_id).await?;
        self.attach_or_replace(sandbox, team_id, subject).await
    }

    /// Attach to `sandbox`, or to one replacement if it stopped accepting
    /// conversations after it was acquired.
    pub(crate) async fn attach_or_replace(
        &self,
        sandbox: Sandbox,
        team_id: &str,
        subject: &str,
    ) -> Result<Sandbox> {
        if self.sandboxes.attach(&sandbox.id).await? {
            return Ok(sandbox);
        }
        warn!(sandbox_id = %sandbox.id, subject, "Acquired sandbox refused the conversation, replacing");
        let replacement = self.acquire_sandbox(team_id).await?;
        if self.sandboxes.attach(&replacement.id).await? {
            return Ok(replacement);
        }
        Err(PipelineError::SandboxUnavailable(subject.to_string()))
    }

    /// Ask the sandbox to open the agent session; activates the conversation on success.
    async fn initialize(
        &self,
        conversation: &Conversation,
        endpoint: &SandboxEndpoint,
    ) -> std::result::Result<(), ClientError> {
        let request = InitRequest {
            conversation_id: conversation.id.clone(),
            session_id: conversation.session_id.clone(),
            provider_id: conversation.agent_provider.clone(),
            cwd: conversation.cwd.clone(),
        };
        self.transport.init(endpoint, &request).await?;

        if let Err(e) = self
            .store
            .set_conversation_status(&conversation.id, ConversationStatus::Active)
            .await
        {
            error!(conversation_id = %conversation.id, "Failed to activate conversation: {}", e);
        }
        info!(conversation_id = %conversation.id, sandbox_id = %endpoint.sandbox_id, "Conversation initialized");
        Ok(())
    }

    /// Start (or return) the team's conversation for `client_key`.
    pub async fn start_conversation(
        &self,
        auth: &AuthContext,
        request: StartConversationRequest,
    ) -> Result<StartedConversation> {
        let identity = auth.require()?;
        if request.client_key.trim().is_empty() {
            return Err(PipelineError::Validation("client key is required".to_string()));
        }
        if request.agent_provider.trim().is_empty() {
            return Err(PipelineError::Validation("agent provider is required".to_string()));
        }

        if let Some(existing) = self
            .store
            .find_open_conversation(&identity.team_id, &request.client_key)
            .await?
        {
            debug!(conversation_id = %existing.id, "Returning existing conversation for key");
            return self.recheck(existing, false).await;
        }

        let sandbox = self
            .acquire_attached(&identity.team_id, &request.client_key)
            .await?;

        let (conversation, created) = self
            .store
            .create_conversation(NewConversation {
                team_id: identity.team_id.clone(),
                user_id: identity.subject.clone(),
                agent_provider: request.agent_provider,
                cwd: request.cwd,
                client_key: request.client_key,
                sandbox_id: Some(sandbox.id.clone()),
                status: ConversationStatus::Initializing,
            })
            .await?;

        if !created {
            // Lost a race on the key; the spare sandbox is left to the idle sweep
            debug!(sandbox_id = %sandbox.id, "Conversation key raced, releasing sandbox");
            self.sandboxes.detach(&sandbox.id).await?;
            return self.recheck(conversation, false).await;
        }

        info!(conversation_id = %conversation.id, sandbox_id = %sandbox.id, "Conversation started");
        self.recheck(conversation, true).await
    }

    /// Re-read sandbox state for a conversation, rebinding it when its sandbox is gone
    /// and initializing it when possible.
    async fn recheck(&self, conversation: Conversation, created: bool) -> Result<StartedConversation> {
        let mut conversation = conversation;

        let sandbox = match conversation.sandbox_id.as_deref() {
            Some(id) => self.sandboxes.refresh_status(id).await?,
            None => None,
        };

        let sandbox = match sandbox {
            Some(sandbox) if !sandbox.status.is_terminal() && sandbox.status != SandboxStatus::Stopping => sandbox,
            _ => {
                let replacement = self
                    .acquire_attached(&conversation.team_id, &conversation.id)
                    .await?;
                if let Some(previous) = conversation.sandbox_id.as_deref() {
                    self.sandboxes.detach(previous).await?;
                }
                self.store
                    .set_conversation_sandbox(&conversation.id, &replacement.id)
                    .await?;
                self.store
                    .set_conversation_status(&conversation.id, ConversationStatus::Initializing)
                    .await?;
                warn!(conversation_id = %conversation.id, sandbox_id = %replacement.id, "Rebound conversation to new sandbox");
                conversation.sandbox_id = Some(replacement.id.clone());
                conversation.status = ConversationStatus::Initializing;
                replacement
            }
        };

        if conversation.status == ConversationStatus::Initializing {
            if let Some(endpoint) = endpoint(&sandbox) {
                match self.initialize(&conversation, &endpoint).await {
                    Ok(()) => conversation.status = ConversationStatus::Active,
                    Err(e) => {
                        warn!(conversation_id = %conversation.id, "Conversation init failed: {}", e)
                    }
                }
            }
        }

        let status = if conversation.status == ConversationStatus::Active
            && sandbox.status == SandboxStatus::Running
        {
            StartStatus::Ready
        } else {
            StartStatus::Initializing
        };

        Ok(StartedConversation {
            conversation,
            status,
            created,
        })
    }

    /// Queue a user message. Repeating a `client_key` returns the original message
    /// unchanged and schedules nothing.
    pub async fn send_message(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
        content: Vec<ContentBlock>,
        client_key: &str,
    ) -> Result<Message> {
        let identity = auth.require()?;
        if client_key.trim().is_empty() {
            return Err(PipelineError::Validation("client key is required".to_string()));
        }
        if content.is_empty() {
            return Err(PipelineError::Validation("message content is empty".to_string()));
        }

        let conversation = self.owned_conversation(identity, conversation_id).await?;

        if let Some(existing) = self
            .store
            .find_message_by_client_key(&conversation.id, client_key)
            .await?
        {
            return Ok(existing);
        }
        if conversation.status == ConversationStatus::Closed {
            return Err(PipelineError::ConversationClosed(conversation.id));
        }

        let (message, created) = self
            .store
            .insert_message(
                &conversation.id,
                MessageRole::User,
                &content,
                client_key,
                DeliveryStatus::Queued,
            )
            .await?;

        if created {
            self.schedule_delivery(&conversation.id, &message.id, 1, Duration::ZERO)
                .await;
        }
        Ok(message)
    }

    async fn schedule_delivery(
        &self,
        conversation_id: &str,
        message_id: &str,
        attempt: u32,
        delay: Duration,
    ) {
        let job_id = self
            .scheduler
            .run_after(
                delay,
                ScheduledJob::DeliverMessage {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.to_string(),
                    attempt,
                },
            )
            .await;
        debug!(conversation_id, message_id, attempt, ?delay, %job_id, "Delivery scheduled");
    }

    /// Push a queued message into the agent session.
    ///
    /// Background entry point: a missing conversation or message is a silent no-op.
    pub async fn deliver_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        attempt: u32,
    ) -> Result<DeliveryOutcome> {
        let Some(conversation) = self.store.find_conversation(conversation_id).await? else {
            debug!(conversation_id, message_id, "Delivery for missing conversation dropped");
            return Ok(DeliveryOutcome::Skipped);
        };

        let message = match self.store.find_message(message_id).await? {
            Some(message) if message.conversation_id == conversation.id => message,
            _ => {
                debug!(conversation_id, message_id, "Delivery for missing message dropped");
                return Ok(DeliveryOutcome::Skipped);
            }
        };
        if message.delivery_status.is_final() {
            return Ok(DeliveryOutcome::Skipped);
        }

        if conversation.status == ConversationStatus::Closed {
            self.store
                .mark_failed(message_id, "conversation closed")
                .await?;
            return Ok(DeliveryOutcome::Failed);
        }

        if self
            .store
            .has_earlier_undelivered(&conversation.id, message.seq)
            .await?
        {
            let delay = self.settings.base_delay;
            debug!(conversation_id, message_id, attempt, ?delay, "Earlier message pending, delivery deferred");
            self.schedule_delivery(&conversation.id, message_id, attempt, delay)
                .await;
            return Ok(DeliveryOutcome::Deferred { delay });
        }

        let Some(total_attempts) = self.store.begin_attempt(message_id).await? else {
            return Ok(DeliveryOutcome::Skipped);
        };
        debug!(conversation_id, message_id, attempt, total_attempts, "Delivering message");

        let Some(endpoint) = self.conversation_endpoint(&conversation).await? else {
            return self
                .delivery_failed(&conversation, &message, attempt, "sandbox not running")
                .await;
        };

        if conversation.status == ConversationStatus::Initializing {
            if let Err(e) = self.initialize(&conversation, &endpoint).await {
                return self
                    .delivery_failed(&conversation, &message, attempt, &e.to_string())
                    .await;
            }
        }

        let request = PromptRequest {
            conversation_id: conversation.id.clone(),
            session_id: conversation.session_id.clone(),
            content: message.content.clone(),
        };

        match self.transport.prompt(&endpoint, &request).await {
            Ok(response) if response.accepted => {
                self.store.mark_delivered(message_id).await?;
                if let Err(e) = self.sandboxes.touch(&endpoint.sandbox_id).await {
                    warn!(sandbox_id = %endpoint.sandbox_id, "Failed to record activity: {}", e);
                }
                info!(conversation_id, message_id, attempt, "Message delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Ok(_) => {
                self.delivery_failed(&conversation, &message, attempt, &ClientError::Rejected.to_string())
                    .await
            }
            Err(e) => {
                self.delivery_failed(&conversation, &message, attempt, &e.to_string())
                    .await
            }
        }
    }

    async fn delivery_failed(
        &self,
        conversation: &Conversation,
        message: &Message,
        attempt: u32,
        reason: &str,
    ) -> Result<DeliveryOutcome> {
        if attempt >= self.settings.max_attempts {
            self.store.mark_failed(&message.id, reason).await?;
            error!(
                conversation_id = %conversation.id,
                message_id = %message.id,
                attempt,
                reason,
                "Message delivery failed permanently"
            );

            let notice = ContentBlock::text(format!(
                "Message {} could not be delivered after {} attempts: {}",
                message.id, attempt, reason
            ));
            self.store
                .insert_message(
                    &conversation.id,
                    MessageRole::System,
                    &[notice],
                    &format!("delivery-failed:{}", message.id),
                    DeliveryStatus::Delivered,
                )
                .await?;
            return Ok(DeliveryOutcome::Failed);
        }

        self.store.mark_requeued(&message.id, reason).await?;
        let delay = self.settings.backoff_delay(attempt);
        let next_attempt = attempt + 1;
        warn!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            attempt,
            ?delay,
            reason,
            "Delivery attempt failed, retrying"
        );
        self.schedule_delivery(&conversation.id, &message.id, next_attempt, delay)
            .await;

        Ok(DeliveryOutcome::Rescheduled {
            next_attempt,
            delay,
        })
    }

    /// Operator-triggered re-delivery. Unlike scheduled delivery, a missing
    /// conversation is an error.
    pub async fn retry_message(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Message> {
        let identity = auth.require()?;
        let conversation = self.owned_conversation(identity, conversation_id).await?;

        let message = self
            .store
            .find_message(message_id)
            .await?
            .filter(|m| m.conversation_id == conversation.id)
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))?;

        if message.role != MessageRole::User {
            return Err(PipelineError::Validation(
                "only user messages can be redelivered".to_string(),
            ));
        }

        if self.store.requeue_for_retry(&message.id).await? {
            info!(conversation_id, message_id, "Manual retry requested");
            self.schedule_delivery(&conversation.id, &message.id, 1, Duration::ZERO)
                .await;
        }

        self.store
            .find_message(&message.id)
            .await?
            .ok_or_else(|| PipelineError::MessageNotFound(message_id.to_string()))
    }

    /// Schedule every undelivered user message again, starting a fresh attempt
    /// series. Timers do not survive a restart, so this runs at startup.
    pub async fn resume_pending_deliveries(&self) -> Result<usize> {
        let interrupted = self.store.reset_interrupted_deliveries().await?;
        if interrupted > 0 {
            warn!(interrupted, "Requeued deliveries interrupted by a restart");
        }
        let pending = self.store.pending_deliveries().await?;
        for message in &pending {
            self.schedule_delivery(&message.conversation_id, &message.id, 1, Duration::ZERO)
                .await;
        }
        Ok(pending.len())
    }

    /// Forward an opaque protocol payload to the conversation's sandbox.
    pub async fn send_rpc(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
        payload: &JsonValue,
    ) -> Result<JsonValue> {
        let identity = auth.require()?;
        let conversation = self.owned_conversation(identity, conversation_id).await?;

        let endpoint = self
            .conversation_endpoint(&conversation)
            .await?
            .ok_or_else(|| PipelineError::SandboxUnavailable(conversation.id.clone()))?;

        Ok(self.transport.rpc(&endpoint, payload).await?)
    }

    /// Close a conversation and release its hold on the sandbox.
    pub async fn close_conversation(&self, auth: &AuthContext, conversation_id: &str) -> Result<()> {
        let identity = auth.require()?;
        let conversation = self.owned_conversation(identity, conversation_id).await?;

        if self.store.close_conversation(&conversation.id).await? {
            if let Some(sandbox_id) = conversation.sandbox_id.as_deref() {
                self.sandboxes.detach(sandbox_id).await?;
            }
            info!(conversation_id, "Conversation closed");
        }
        Ok(())
    }

    /// Store streamed agent output as an assistant message.
    ///
    /// Background entry point: output for a missing conversation is dropped.
    pub async fn record_agent_output(
        &self,
        conversation_id: &str,
        content: Vec<ContentBlock>,
        client_key: &str,
    ) -> Result<Option<Message>> {
        let Some(conversation) = self.store.find_conversation(conversation_id).await? else {
            debug!(conversation_id, "Agent output for missing conversation dropped");
            return Ok(None);
        };

        let (message, _) = self
            .store
            .insert_message(
                &conversation.id,
                MessageRole::Assistant,
                &content,
                client_key,
                DeliveryStatus::Delivered,
            )
            .await?;

        if let Some(sandbox_id) = conversation.sandbox_id.as_deref() {
            if let Err(e) = self.sandboxes.touch(sandbox_id).await {
                warn!(sandbox_id, "Failed to record activity: {}", e);
            }
        }
        Ok(Some(message))
    }

    pub async fn get_conversation(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
    ) -> Result<Conversation> {
        let identity = auth.require()?;
        self.owned_conversation(identity, conversation_id).await
    }

    pub async fn list_messages(
        &self,
        auth: &AuthContext,
        conversation_id: &str,
    ) -> Result<Vec<Message>> {
        let identity = auth.require()?;
        let conversation = self.owned_conversation(identity, conversation_id).await?;
        Ok(self.store.list_messages(&conversation.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = DeliverySettings {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        };

        assert_eq!(settings.nominal_delay(1), Duration::from_secs(1));
        assert_eq!(settings.nominal_delay(2), Duration::from_secs(2));
        assert_eq!(settings.nominal_delay(3), Duration::from_secs(4));
        assert_eq!(settings.nominal_delay(4), Duration::from_secs(5));
        assert_eq!(settings.nominal_delay(40), Duration::from_secs(5));

        for attempt in 1..=6 {
            let nominal = settings.nominal_delay(attempt).as_secs_f64();
            let delay = settings.backoff_delay(attempt).as_secs_f64();
            assert!(delay >= nominal * 0.8 - 1e-9 && delay <= nominal * 1.2 + 1e-9);
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let settings = DeliverySettings {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(settings.backoff_delay(3), Duration::from_secs(4));
    }
}
