// ABOUTME: Docker provider implementation for container-backed sandboxes
// ABOUTME: Uses bollard to run one sandbox server container per sandbox

use super::{
    InstanceState, InstanceStatus, Provider, ProviderError, Result, SpawnConfig, SpawnedInstance,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{ContainerInspectResponse, HostConfig, PortBinding},
    Docker,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Port the sandbox HTTP server listens on inside the container
pub const SANDBOX_PORT: u16 = 8080;

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Images already pulled during this process lifetime
    pulled_images: Arc<RwLock<HashSet<String>>>,
    pull_timeout: Duration,
    stop_timeout_secs: i64,
}

impl DockerProvider {
    /// Connect to the local Docker daemon with a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: "fleet.sandbox".to_string(),
            pulled_images: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout: Duration::from_secs(600),
            stop_timeout_secs: 10,
        }
    }

    fn to_bollard_config(&self, config: &SpawnConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(format!("{}.id", self.label_prefix), config.sandbox_id.clone());

        let container_port = format!("{}/tcp", SANDBOX_PORT);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port.clone(), HashMap::new());

        // Empty host port lets the daemon pick a free one
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(config.image.clone()),
            env: Some(env),
            working_dir: config.working_dir.clone(),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn convert_status(state: &str) -> InstanceStatus {
        match state.to_lowercase().as_str() {
            "created" => InstanceStatus::Pending,
            "running" | "restarting" => InstanceStatus::Running,
            "paused" => InstanceStatus::Paused,
            "exited" | "removing" | "dead" => InstanceStatus::Stopped,
            other => InstanceStatus::Error(format!("Unknown status: {}", other)),
        }
    }

    fn sandbox_url(inspect: &ContainerInspectResponse) -> Option<String> {
        let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
        let bindings = ports.get(&format!("{}/tcp", SANDBOX_PORT))?.as_ref()?;
        let host_port = bindings.first()?.host_port.as_ref()?;
        if host_port.is_empty() {
            return None;
        }
        Some(format!("http://127.0.0.1:{}", host_port))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInspectResponse> {
        self.client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_docker_error(container_id, e))
    }

    /// Force-remove a container and its volumes; failures are only logged
    async fn remove(&self, container_id: &str) {
        if let Err(e) = self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container_id, "Failed to remove container: {}", e);
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.pulled_images.read().await.contains(image) {
            debug!("Image {} already pulled", image);
            return Ok(());
        }

        match self.client.inspect_image(image).await {
            Ok(_) => {
                self.pulled_images.write().await.insert(image.to_string());
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_docker_error(image, e)),
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(self.pull_timeout, async {
            while let Some(progress) = stream.next().await {
                let progress = progress.map_err(|e| map_docker_error(image, e))?;
                if let Some(error) = progress.error {
                    return Err(ProviderError::ConfigError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await
        .map_err(|_| {
            ProviderError::ConnectionError(format!(
                "Timed out pulling image {} after {:?}",
                image, self.pull_timeout
            ))
        })?;
        pulled?;

        self.pulled_images.write().await.insert(image.to_string());
        Ok(())
    }
}

fn map_docker_error(subject: &str, err: bollard::errors::Error) -> ProviderError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ProviderError::InstanceNotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => ProviderError::Api {
            status: status_code,
            message,
        },
        other => ProviderError::ConnectionError(other.to_string()),
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedInstance> {
        info!(sandbox_id = %config.sandbox_id, image = %config.image, "Creating sandbox container");

        self.ensure_image(&config.image).await?;

        let options = CreateContainerOptions {
            name: format!("fleet-{}", config.sandbox_id),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.to_bollard_config(config))
            .await
            .map_err(|e| map_docker_error(&config.sandbox_id, e))?;

        let started = async {
            self.client
                .start_container(&container.id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| map_docker_error(&container.id, e))?;
            self.inspect(&container.id).await
        }
        .await;

        let inspect = match started {
            Ok(inspect) => inspect,
            Err(e) => {
                // The caller never learns this id
                self.remove(&container.id).await;
                return Err(e);
            }
        };
        debug!(container_id = %container.id, "Started sandbox container");

        Ok(SpawnedInstance {
            instance_id: container.id,
            sandbox_url: Self::sandbox_url(&inspect),
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
        let inspect = self.inspect(instance_id).await?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|s| Self::convert_status(s.as_ref()))
            .unwrap_or_else(|| InstanceStatus::Error("Container has no state".to_string()));

        Ok(InstanceState {
            status,
            sandbox_url: Self::sandbox_url(&inspect),
        })
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        info!(instance_id, "Stopping sandbox container");

        let stopped = self
            .client
            .stop_container(
                instance_id,
                Some(StopContainerOptions {
                    t: self.stop_timeout_secs,
                }),
            )
            .await;

        match stopped {
            Ok(()) => {}
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(map_docker_error(instance_id, e)),
        }

        self.remove(instance_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_status() {
        assert_eq!(
            DockerProvider::convert_status("running"),
            InstanceStatus::Running
        );
        assert_eq!(
            DockerProvider::convert_status("created"),
            InstanceStatus::Pending
        );
        assert_eq!(
            DockerProvider::convert_status("exited"),
            InstanceStatus::Stopped
        );
        assert!(matches!(
            DockerProvider::convert_status("weird"),
            InstanceStatus::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_container_removed_when_start_fails() {
        use wiremock::matchers::{method, path_regex};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/images/.+/json$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"/containers/create$"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "Id": "c0ffee", "Warnings": [] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"/containers/c0ffee/start$"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(serde_json::json!({ "message": "port is already allocated" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex(r"/containers/c0ffee$"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            Docker::connect_with_http(&server.uri(), 5, bollard::API_DEFAULT_VERSION).unwrap();
        let provider = DockerProvider::with_client(client);
        let config = SpawnConfig {
            sandbox_id: "sbx_1".to_string(),
            image: "fleet/sandbox:test".to_string(),
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            working_dir: None,
        };

        let err = provider.spawn(&config).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, .. }));
        // MockServer verifies the single DELETE on drop
    }

    #[test]
    fn test_not_found_maps_to_permanent_error() {
        let err = map_docker_error(
            "abc",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }
}
