// ABOUTME: MicroVM provider backed by a hosted instance REST API
// ABOUTME: Spawns sandboxes from a snapshot and tracks them by remote instance id

use super::{
    InstanceState, InstanceStatus, Provider, ProviderError, Result, SpawnConfig, SpawnedInstance,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Serialize)]
struct CreateInstanceRequest<'a> {
    snapshot_id: &'a str,
    env: &'a HashMap<String, String>,
    metadata: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct InstanceResponse {
    id: String,
    status: String,
    #[serde(default)]
    url: Option<String>,
}

pub struct MicroVmProvider {
    client: Client,
    api_url: String,
    api_key: String,
}

impl MicroVmProvider {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(ProviderError::ConfigError(
                "MicroVM API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn convert_status(status: &str) -> InstanceStatus {
        match status {
            "pending" | "starting" | "booting" => InstanceStatus::Pending,
            "ready" | "running" => InstanceStatus::Running,
            "paused" | "suspended" => InstanceStatus::Paused,
            "stopped" | "terminated" => InstanceStatus::Stopped,
            other => InstanceStatus::Error(format!("Unknown status: {}", other)),
        }
    }

    async fn check(instance_id: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        }

        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

fn map_request_error(err: reqwest::Error) -> ProviderError {
    ProviderError::ConnectionError(err.to_string())
}

#[async_trait]
impl Provider for MicroVmProvider {
    fn name(&self) -> &str {
        "microvm"
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedInstance> {
        let body = CreateInstanceRequest {
            snapshot_id: &config.image,
            env: &config.env_vars,
            metadata: &config.labels,
        };

        let response = self
            .client
            .post(format!("{}/instances", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = Self::check(&config.sandbox_id, response).await?;

        let instance: InstanceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InternalError(format!("Bad instance payload: {}", e)))?;

        info!(sandbox_id = %config.sandbox_id, instance_id = %instance.id, "Started microVM instance");
        Ok(SpawnedInstance {
            instance_id: instance.id,
            sandbox_url: instance.url,
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
        let response = self
            .client
            .get(format!("{}/instances/{}", self.api_url, instance_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = Self::check(instance_id, response).await?;

        let instance: InstanceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InternalError(format!("Bad instance payload: {}", e)))?;

        debug!(instance_id, status = %instance.status, "MicroVM instance status");
        Ok(InstanceState {
            status: Self::convert_status(&instance.status),
            sandbox_url: instance.url,
        })
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/instances/{}/stop", self.api_url, instance_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_request_error)?;
        Self::check(instance_id, response).await?;

        info!(instance_id, "Stopped microVM instance");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> SpawnConfig {
        let mut env_vars = HashMap::new();
        env_vars.insert("FLEET_SANDBOX_ID".to_string(), "sbx_vm".to_string());
        SpawnConfig {
            sandbox_id: "sbx_vm".to_string(),
            image: "snap_base".to_string(),
            env_vars,
            labels: HashMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_posts_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .and(bearer_token("vm-key"))
            .and(body_partial_json(json!({ "snapshot_id": "snap_base" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "vm_123",
                "status": "booting",
                "url": "https://vm-123.example.test"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MicroVmProvider::new(server.uri(), "vm-key").unwrap();
        let spawned = provider.spawn(&config()).await.unwrap();

        assert_eq!(spawned.instance_id, "vm_123");
        assert_eq!(
            spawned.sandbox_url.as_deref(),
            Some("https://vm-123.example.test")
        );
    }

    #[tokio::test]
    async fn test_status_and_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/instances/vm_live"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "vm_live",
                "status": "ready"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/instances/vm_gone/stop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = MicroVmProvider::new(server.uri(), "vm-key").unwrap();

        let state = provider.get_status("vm_live").await.unwrap();
        assert_eq!(state.status, InstanceStatus::Running);

        let err = provider.stop("vm_gone").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances"))
            .respond_with(ResponseTemplate::new(503).set_body_string("capacity"))
            .mount(&server)
            .await;

        let provider = MicroVmProvider::new(server.uri(), "vm-key").unwrap();
        let err = provider.spawn(&config()).await.unwrap_err();

        assert!(matches!(err, ProviderError::Api { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_requires_api_key() {
        assert!(MicroVmProvider::new("https://vm.example.test", "").is_err());
    }
}
