// ABOUTME: Provider trait and implementations for sandbox compute backends
// ABOUTME: Defines the spawn/status/stop seam that keeps the fleet portable across backends

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod docker;
pub mod local;
pub mod microvm;

pub use docker::DockerProvider;
pub use local::LocalProcessProvider;
pub use microvm::MicroVmProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("Provider not registered: {0}")]
    UnknownProvider(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProviderError {
    /// Transient failures are worth retrying; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::ConnectionError(_) | ProviderError::NotAvailable(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            ProviderError::InstanceNotFound(_)
            | ProviderError::ConfigError(_)
            | ProviderError::UnknownProvider(_)
            | ProviderError::InternalError(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::InstanceNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// What a provider needs to bring up one sandbox instance
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub sandbox_id: String,
    /// Container image or VM snapshot reference
    pub image: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnedInstance {
    pub instance_id: String,
    pub sandbox_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub sandbox_url: Option<String>,
}

/// Compute backend capable of hosting sandbox instances
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, also stored on every sandbox record
    fn name(&self) -> &str;

    /// Bring up a new instance and return its provider-assigned id
    async fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedInstance>;

    /// Current provider-side status of an instance
    async fn get_status(&self, instance_id: &str) -> Result<InstanceState>;

    /// Tear down an instance
    async fn stop(&self, instance_id: &str) -> Result<()>;
}

/// Providers available to the lifecycle manager, fixed at construction
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    pub fn default_provider(&self) -> Result<Arc<dyn Provider>> {
        self.get(&self.default_provider)
    }

    pub fn default_name(&self) -> &str {
        &self.default_provider
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedProvider(&'static str);

    #[async_trait]
    impl Provider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        async fn spawn(&self, _config: &SpawnConfig) -> Result<SpawnedInstance> {
            Err(ProviderError::NotAvailable("test".to_string()))
        }

        async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
            Err(ProviderError::InstanceNotFound(instance_id.to_string()))
        }

        async fn stop(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new("docker")
            .with_provider(Arc::new(NamedProvider("docker")))
            .with_provider(Arc::new(NamedProvider("microvm")));

        assert_eq!(registry.names(), vec!["docker", "microvm"]);
        assert_eq!(registry.default_provider().unwrap().name(), "docker");
        assert!(matches!(
            registry.get("lambda"),
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::ConnectionError("reset".into()).is_transient());
        assert!(ProviderError::Api {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!ProviderError::InstanceNotFound("i-1".into()).is_transient());
        assert!(ProviderError::InstanceNotFound("i-1".into()).is_not_found());
    }
}
