// ABOUTME: In-memory provider double for lifecycle and pipeline tests
// ABOUTME: Records spawn/stop calls and can be told to fail on demand

use crate::providers::{
    InstanceState, InstanceStatus, Provider, ProviderError, Result, SpawnConfig, SpawnedInstance,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MockProvider {
    instances: Mutex<HashMap<String, InstanceStatus>>,
    spawned: Mutex<Vec<SpawnConfig>>,
    stops: AtomicUsize,
    fail_spawn: AtomicBool,
    fail_stop: AtomicBool,
    sandbox_url: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL reported for every spawned instance
    pub fn with_sandbox_url(self, url: impl Into<String>) -> Self {
        if let Ok(mut slot) = self.sandbox_url.lock() {
            *slot = Some(url.into());
        }
        self
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.insert(instance_id.to_string(), status);
        }
    }

    pub fn forget(&self, instance_id: &str) {
        if let Ok(mut instances) = self.instances.lock() {
            instances.remove(instance_id);
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn spawned_configs(&self) -> Vec<SpawnConfig> {
        self.spawned.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

fn poisoned() -> ProviderError {
    ProviderError::InternalError("mock provider lock poisoned".to_string())
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedInstance> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionError("mock spawn failure".to_string()));
        }

        let instance_id = format!("mock-{}", config.sandbox_id);
        self.instances
            .lock()
            .map_err(|_| poisoned())?
            .insert(instance_id.clone(), InstanceStatus::Running);
        self.spawned
            .lock()
            .map_err(|_| poisoned())?
            .push(config.clone());

        let sandbox_url = self.sandbox_url.lock().map_err(|_| poisoned())?.clone();
        Ok(SpawnedInstance {
            instance_id,
            sandbox_url,
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<InstanceState> {
        let status = self
            .instances
            .lock()
            .map_err(|_| poisoned())?
            .get(instance_id)
            .cloned()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        Ok(InstanceState {
            status,
            sandbox_url: None,
        })
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionError("mock stop failure".to_string()));
        }

        match self.instances.lock().map_err(|_| poisoned())?.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::InstanceNotFound(instance_id.to_string())),
        }
    }
}
