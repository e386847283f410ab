// ABOUTME: Conversations, messages and the delivery pipeline that pushes them into sandboxes
// ABOUTME: Also hosts the sandbox HTTP client and caller identity types

pub mod client;
pub mod identity;
pub mod pipeline;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


pub use client::{
    ClientError, ExecRequest, ExecResult, HttpSandboxTransport, SandboxEndpoint,
    SandboxTransport, StaticTokenSource, TokenCache, TokenSource,
};
pub use identity::{AuthContext, Identity};
pub use pipeline::{
    DeliveryOutcome, DeliveryPipeline, DeliverySettings, PipelineError, StartConversationRequest,
    StartStatus, StartedConversation,
};
pub use store::ConversationStore;
pub use types::{
    ContentBlock, Conversation, ConversationStatus, DeliveryStatus, Message, MessageRole,
};
