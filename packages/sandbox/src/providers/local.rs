// ABOUTME: Local process provider running the sandbox server as a child process
// ABOUTME: Used for development and tests where no container runtime is available

use super::{
    InstanceState, InstanceStatus, Provider, ProviderError, Result, SpawnConfig, SpawnedInstance,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Environment variable carrying the port the child should listen on
pub const SANDBOX_PORT_ENV: &str = "FLEET_SANDBOX_PORT";

pub struct LocalProcessProvider {
    command: Vec<String>,
    children: Arc<Mutex<HashMap<String, Child>>>,
    kill_timeout: Duration,
}

impl LocalProcessProvider {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(ProviderError::ConfigError(
                "Local sandbox command must not be empty".to_string(),
            ));
        }

        Ok(Self {
            command,
            children: Arc::new(Mutex::new(HashMap::new())),
            kill_timeout: Duration::from_secs(5),
        })
    }

    fn free_port() -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| ProviderError::InternalError(format!("No free port: {}", e)))?;
        listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| ProviderError::InternalError(e.to_string()))
    }
}

#[async_trait]
impl Provider for LocalProcessProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedInstance> {
        let port = Self::free_port()?;

        let mut command = Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .envs(&config.env_vars)
            .env(SANDBOX_PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            ProviderError::ConfigError(format!(
                "Failed to start local sandbox '{}': {}",
                self.command[0], e
            ))
        })?;

        let instance_id = format!("local-{}", config.sandbox_id);
        info!(instance_id = %instance_id, pid = ?child.id(), port, "Started local sandbox process");

        self.children
            .lock()
            .await
            .insert(instance_id.clone(), child);

        Ok(SpawnedInstance {
            instance_id,
            sandbox_url: Some(format!("http://127.0.0.1:{}", port)),
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
        let mut children = self.children.lock().await;
        let child = children
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;

        let status = match child.try_wait() {
            Ok(None) => InstanceStatus::Running,
            Ok(Some(exit)) if exit.success() => InstanceStatus::Stopped,
            Ok(Some(exit)) => InstanceStatus::Error(format!("Process exited with {}", exit)),
            Err(e) => InstanceStatus::Error(e.to_string()),
        };

        Ok(InstanceState {
            status,
            sandbox_url: None,
        })
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let mut child = self
            .children
            .lock()
            .await
            .remove(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;

        if let Err(e) = child.start_kill() {
            // Already exited
            warn!(instance_id, "Kill failed: {}", e);
        }

        if tokio::time::timeout(self.kill_timeout, child.wait())
            .await
            .is_err()
        {
            warn!(instance_id, "Local sandbox did not exit within {:?}", self.kill_timeout);
        }

        info!(instance_id, "Stopped local sandbox process");
        Ok(())
    }
}
