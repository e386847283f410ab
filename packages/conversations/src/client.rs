// ABOUTME: HTTP client for the sandbox-side agent server
// ABOUTME: Conversation init, prompt push, health, exec and opaque RPC with cached bearer tokens

use crate::types::ContentBlock;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Sandbox {0} has no reachable URL")]
    MissingUrl(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Sandbox returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Sandbox rejected the prompt")]
    Rejected,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Token error: {0}")]
    Token(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Connection(_) | ClientError::Rejected | ClientError::MissingUrl(_) => {
                true
            }
            ClientError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 401,
            ClientError::InvalidResponse(_) | ClientError::Token(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Where to reach one sandbox's agent server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    pub sandbox_id: String,
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitRequest {
    pub conversation_id: String,
    pub session_id: String,
    pub provider_id: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRequest {
    pub conversation_id: String,
    pub session_id: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// The handful of sandbox calls the fleet needs
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    async fn init(&self, endpoint: &SandboxEndpoint, request: &InitRequest) -> Result<()>;

    async fn prompt(
        &self,
        endpoint: &SandboxEndpoint,
        request: &PromptRequest,
    ) -> Result<PromptResponse>;

    async fn health(&self, endpoint: &SandboxEndpoint) -> Result<HealthStatus>;

    async fn exec(&self, endpoint: &SandboxEndpoint, request: &ExecRequest) -> Result<ExecResult>;

    /// Forward an opaque protocol payload and return the sandbox's reply untouched
    async fn rpc(&self, endpoint: &SandboxEndpoint, payload: &JsonValue) -> Result<JsonValue>;
}

// ============================================================================
// TOKENS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub token: String,
    /// `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

/// Issues bearer tokens for talking to a sandbox
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, sandbox_id: &str) -> Result<Option<IssuedToken>>;
}

/// Same token for every sandbox, or none at all
pub struct StaticTokenSource {
    token: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, _sandbox_id: &str) -> Result<Option<IssuedToken>> {
        Ok(self.token.clone().map(|token| IssuedToken {
            token,
            expires_at: None,
        }))
    }
}

/// Per-sandbox token cache. Entries are refetched on miss, when within the refresh
/// margin of expiry, or after `invalidate`.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    entries: RwLock<HashMap<String, IssuedToken>>,
    refresh_margin: ChronoDuration,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
            refresh_margin: ChronoDuration::seconds(30),
        }
    }

    fn is_fresh(&self, token: &IssuedToken) -> bool {
        match token.expires_at {
            None => true,
            Some(expires_at) => expires_at - self.refresh_margin > Utc::now(),
        }
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<Option<String>> {
        if let Some(cached) = self.entries.read().await.get(sandbox_id) {
            if self.is_fresh(cached) {
                return Ok(Some(cached.token.clone()));
            }
        }

        debug!(sandbox_id, "Fetching sandbox token");
        let issued = self.source.fetch(sandbox_id).await?;
        let mut entries = self.entries.write().await;
        match issued {
            Some(token) => {
                let value = token.token.clone();
                entries.insert(sandbox_id.to_string(), token);
                Ok(Some(value))
            }
            None => {
                entries.remove(sandbox_id);
                Ok(None)
            }
        }
    }

    pub async fn invalidate(&self, sandbox_id: &str) {
        self.entries.write().await.remove(sandbox_id);
    }
}

// ============================================================================
// HTTP TRANSPORT
// ============================================================================

pub struct HttpSandboxTransport {
    client: Client,
    tokens: TokenCache,
}

impl HttpSandboxTransport {
    pub fn new(tokens: TokenCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(Self { client, tokens })
    }

    fn url(endpoint: &SandboxEndpoint, path: &str) -> String {
        format!("{}{}", endpoint.base_url.trim_end_matches('/'), path)
    }

    /// Send with a bearer token, refetching the token once on 401
    async fn send<F>(&self, endpoint: &SandboxEndpoint, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut retried = false;
        loop {
            let mut request = build(&self.client);
            if let Some(token) = self.tokens.get(&endpoint.sandbox_id).await? {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !retried {
                warn!(sandbox_id = %endpoint.sandbox_id, "Sandbox rejected token, refetching");
                self.tokens.invalidate(&endpoint.sandbox_id).await;
                retried = true;
                continue;
            }

            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ClientError::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            return Ok(response);
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl SandboxTransport for HttpSandboxTransport {
    async fn init(&self, endpoint: &SandboxEndpoint, request: &InitRequest) -> Result<()> {
        let url = Self::url(endpoint, "/api/acp/init");
        self.send(endpoint, |client| client.post(&url).json(request))
            .await?;
        Ok(())
    }

    async fn prompt(
        &self,
        endpoint: &SandboxEndpoint,
        request: &PromptRequest,
    ) -> Result<PromptResponse> {
        let url = Self::url(endpoint, "/api/acp/prompt");
        let response = self
            .send(endpoint, |client| client.post(&url).json(request))
            .await?;
        Self::json(response).await
    }

    async fn health(&self, endpoint: &SandboxEndpoint) -> Result<HealthStatus> {
        let url = Self::url(endpoint, "/health");
        let response = self.send(endpoint, |client| client.get(&url)).await?;
        Self::json(response).await
    }

    async fn exec(&self, endpoint: &SandboxEndpoint, request: &ExecRequest) -> Result<ExecResult> {
        let url = Self::url(endpoint, "/api/exec");
        let timeout = Duration::from_millis(request.timeout_ms) + Duration::from_secs(5);
        let response = self
            .send(endpoint, |client| {
                client.post(&url).json(request).timeout(timeout)
            })
            .await?;
        Self::json(response).await
    }

    async fn rpc(&self, endpoint: &SandboxEndpoint, payload: &JsonValue) -> Result<JsonValue> {
        let url = Self::url(endpoint, "/api/acp/rpc");
        let response = self
            .send(endpoint, |client| client.post(&url).json(payload))
            .await?;
        Self::json(response).await
    }
}
