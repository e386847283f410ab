// ABOUTME: Sandbox lifecycle manager orchestrating storage and provider operations
// ABOUTME: Spawning, warm-pool reservation, expiry, stopping and conversation reference counting

use crate::providers::{InstanceStatus, Provider, ProviderError, ProviderRegistry, SpawnConfig};
use crate::storage::{Sandbox, SandboxStatus, SandboxStorage};
use chrono::Utc;
use fleet_config::constants::{FLEET_CALLBACK_SECRET, FLEET_SANDBOX_ID};
use fleet_storage::{ScheduledJob, Scheduler, StorageError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn sandbox {sandbox_id}: {source}")]
    SpawnFailed {
        sandbox_id: String,
        #[source]
        source: ProviderError,
    },
}

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Image or snapshot every new sandbox boots from
    pub image: String,
    /// How long a prewarmed sandbox stays reserved
    pub warm_ttl: Duration,
    /// Running sandboxes with no conversations are stopped after this long
    pub idle_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            image: "ghcr.io/fleet/sandbox:latest".to_string(),
            warm_ttl: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// Sandbox lifecycle manager
pub struct SandboxManager {
    storage: SandboxStorage,
    providers: ProviderRegistry,
    scheduler: Arc<dyn Scheduler>,
    settings: LifecycleSettings,
}

impl SandboxManager {
    pub fn new(
        storage: SandboxStorage,
        providers: ProviderRegistry,
        scheduler: Arc<dyn Scheduler>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            storage,
            providers,
            scheduler,
            settings,
        }
    }

    pub fn storage(&self) -> &SandboxStorage {
        &self.storage
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub async fn get(&self, sandbox_id: &str) -> Result<Option<Sandbox>> {
        Ok(self.storage.find(sandbox_id).await?)
    }

    pub async fn list(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        Ok(self.storage.list(status).await?)
    }

    /// Spawn a sandbox for immediate use.
    ///
    /// The record is persisted as `pending` before the provider is called and always
    /// ends in `running` or `error`, never left pending.
    pub async fn spawn(&self, team_id: &str) -> Result<Sandbox> {
        self.spawn_inner(team_id, None).await
    }

    /// Reserve a warm sandbox for `team_id`.
    ///
    /// Returns the team's existing unexpired reservation when there is one, otherwise
    /// spawns a new paused sandbox and schedules its expiry after the warm TTL.
    pub async fn prewarm(&self, team_id: &str) -> Result<Sandbox> {
        let now = Utc::now();
        if let Some(existing) = self.storage.find_warm_for_team(team_id, &now).await? {
            debug!(sandbox_id = %existing.id, team_id, "Reusing warm reservation");
            return Ok(existing);
        }

        let reserved_until = now + chrono_duration(self.settings.warm_ttl);
        let sandbox = self.spawn_inner(team_id, Some(reserved_until)).await?;

        let job_id = self
            .scheduler
            .run_after(
                self.settings.warm_ttl,
                ScheduledJob::ExpireWarm {
                    sandbox_id: sandbox.id.clone(),
                },
            )
            .await;
        info!(sandbox_id = %sandbox.id, team_id, %job_id, "Prewarmed sandbox");

        Ok(sandbox)
    }

    /// Consume the team's warm sandbox, if any, moving it to running.
    pub async fn claim_warm(&self, team_id: &str) -> Result<Option<Sandbox>> {
        let now = Utc::now();
        match self.storage.claim_warm(team_id, &now).await? {
            Some(id) => {
                info!(sandbox_id = %id, team_id, "Claimed warm sandbox");
                Ok(self.storage.find(&id).await?)
            }
            None => Ok(None),
        }
    }

    /// Expire a warm reservation. Safe to call any number of times: a sandbox that is
    /// gone or no longer warm is left alone.
    pub async fn expire_warm(&self, sandbox_id: &str) -> Result<()> {
        let Some(sandbox) = self.storage.find(sandbox_id).await? else {
            debug!(sandbox_id, "Expiry for missing sandbox ignored");
            return Ok(());
        };

        if sandbox.status != SandboxStatus::Paused {
            debug!(sandbox_id, status = %sandbox.status, "Warm sandbox already consumed");
            return Ok(());
        }

        if !self
            .storage
            .transition(sandbox_id, SandboxStatus::Paused, SandboxStatus::Stopping)
            .await?
        {
            debug!(sandbox_id, "Warm sandbox changed state during expiry");
            return Ok(());
        }

        self.teardown(&sandbox).await;
        self.storage.mark_stopped(sandbox_id, &Utc::now()).await?;
        info!(sandbox_id, "Expired warm sandbox");
        Ok(())
    }

    /// Stop a sandbox. Missing or already stopped sandboxes are a no-op, and provider
    /// failures are logged without blocking the transition to stopped.
    pub async fn stop(&self, sandbox_id: &str) -> Result<()> {
        let Some(sandbox) = self.storage.find(sandbox_id).await? else {
            debug!(sandbox_id, "Stop for missing sandbox ignored");
            return Ok(());
        };

        if !self.storage.begin_stop(sandbox_id).await? {
            debug!(sandbox_id, status = %sandbox.status, "Sandbox already stopping or stopped");
            return Ok(());
        }

        self.teardown(&sandbox).await;
        self.storage.mark_stopped(sandbox_id, &Utc::now()).await?;
        info!(sandbox_id, "Stopped sandbox");
        Ok(())
    }

    /// Count a conversation against the sandbox. False if the sandbox is gone or
    /// not in a state that accepts conversations.
    pub async fn attach(&self, sandbox_id: &str) -> Result<bool> {
        let attached = self.storage.attach(sandbox_id, &Utc::now()).await?;
        if !attached {
            warn!(sandbox_id, "Sandbox not attachable");
        }
        Ok(attached)
    }

    pub async fn detach(&self, sandbox_id: &str) -> Result<bool> {
        Ok(self.storage.detach(sandbox_id, &Utc::now()).await?)
    }

    pub async fn touch(&self, sandbox_id: &str) -> Result<()> {
        Ok(self.storage.touch(sandbox_id, &Utc::now()).await?)
    }

    /// Reconcile the stored status with what the provider reports.
    pub async fn refresh_status(&self, sandbox_id: &str) -> Result<Option<Sandbox>> {
        let Some(sandbox) = self.storage.find(sandbox_id).await? else {
            return Ok(None);
        };

        let Some(instance_id) = sandbox.instance_id.clone() else {
            return Ok(Some(sandbox));
        };
        if matches!(
            sandbox.status,
            SandboxStatus::Stopping | SandboxStatus::Stopped | SandboxStatus::Error
        ) {
            return Ok(Some(sandbox));
        }

        let provider = self.providers.get(&sandbox.provider)?;
        let now = Utc::now();

        match provider.get_status(&instance_id).await {
            Ok(state) => {
                if let Some(url) = state.sandbox_url.as_deref() {
                    if sandbox.sandbox_url.as_deref() != Some(url) {
                        self.storage.update_url(sandbox_id, url).await?;
                    }
                }

                match state.status {
                    InstanceStatus::Running => {
                        self.storage
                            .transition(sandbox_id, SandboxStatus::Pending, SandboxStatus::Running)
                            .await?;
                    }
                    InstanceStatus::Stopped => {
                        warn!(sandbox_id, "Provider reports sandbox stopped");
                        self.storage.mark_stopped(sandbox_id, &now).await?;
                    }
                    InstanceStatus::Error(message) => {
                        warn!(sandbox_id, %message, "Provider reports sandbox error");
                        self.storage.mark_error(sandbox_id, &message).await?;
                    }
                    InstanceStatus::Pending | InstanceStatus::Paused => {}
                }
            }
            Err(e) if e.is_not_found() => {
                warn!(sandbox_id, "Provider no longer knows sandbox instance");
                self.storage.mark_stopped(sandbox_id, &now).await?;
            }
            Err(e) => {
                warn!(sandbox_id, "Status check failed: {}", e);
            }
        }

        Ok(self.storage.find(sandbox_id).await?)
    }

    /// Expire every warm sandbox whose reservation has lapsed.
    pub async fn sweep_expired_warm(&self) -> Result<usize> {
        let ids = self.storage.expired_warm_ids(&Utc::now()).await?;
        let mut expired = 0;
        for id in ids {
            match self.expire_warm(&id).await {
                Ok(()) => expired += 1,
                Err(e) => error!(sandbox_id = %id, "Failed to expire warm sandbox: {}", e),
            }
        }
        Ok(expired)
    }

    /// Stop running sandboxes with no conversations and no recent activity.
    pub async fn sweep_idle(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono_duration(self.settings.idle_timeout);
        let ids = self.storage.idle_running_ids(&cutoff).await?;

        let mut stopped = 0;
        for id in ids {
            let Some(sandbox) = self.storage.find(&id).await? else {
                continue;
            };
            if !self.storage.begin_idle_stop(&id, &cutoff).await? {
                continue;
            }

            self.teardown(&sandbox).await;
            self.storage.mark_stopped(&id, &Utc::now()).await?;
            info!(sandbox_id = %id, "Stopped idle sandbox");
            stopped += 1;
        }
        Ok(stopped)
    }

    async fn spawn_inner(
        &self,
        team_id: &str,
        reserved_until: Option<chrono::DateTime<Utc>>,
    ) -> Result<Sandbox> {
        let provider = self.providers.default_provider()?;
        let now = Utc::now();
        let secret = generate_callback_secret();

        let sandbox = Sandbox {
            id: format!("sbx_{}", uuid::Uuid::new_v4().simple()),
            provider: provider.name().to_string(),
            instance_id: None,
            sandbox_url: None,
            status: SandboxStatus::Pending,
            team_id: Some(team_id.to_string()),
            callback_fingerprint: Some(callback_fingerprint(&secret)),
            image: self.settings.image.clone(),
            conversation_count: 0,
            reserved_until,
            error_message: None,
            last_activity_at: now,
            created_at: now,
            stopped_at: None,
        };
        self.storage.create(&sandbox).await?;

        let mut env_vars = HashMap::new();
        env_vars.insert(FLEET_SANDBOX_ID.to_string(), sandbox.id.clone());
        env_vars.insert(FLEET_CALLBACK_SECRET.to_string(), secret);

        let mut labels = HashMap::new();
        labels.insert("fleet.team".to_string(), team_id.to_string());

        let config = SpawnConfig {
            sandbox_id: sandbox.id.clone(),
            image: sandbox.image.clone(),
            env_vars,
            labels,
            working_dir: None,
        };

        let spawned = match provider.spawn(&config).await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(sandbox_id = %sandbox.id, provider = provider.name(), "Spawn failed: {}", e);
                self.storage.mark_error(&sandbox.id, &e.to_string()).await?;
                return Err(ManagerError::SpawnFailed {
                    sandbox_id: sandbox.id,
                    source: e,
                });
            }
        };

        let status = if reserved_until.is_some() {
            SandboxStatus::Paused
        } else {
            SandboxStatus::Running
        };

        let recorded = self
            .storage
            .record_spawned(
                &sandbox.id,
                &spawned.instance_id,
                spawned.sandbox_url.as_deref(),
                status,
                &Utc::now(),
            )
            .await?;

        if !recorded {
            // Stopped while the provider call was in flight
            warn!(sandbox_id = %sandbox.id, "Sandbox left pending during spawn, tearing down");
            if let Err(e) = provider.stop(&spawned.instance_id).await {
                warn!(sandbox_id = %sandbox.id, "Cleanup stop failed: {}", e);
            }
        } else {
            info!(
                sandbox_id = %sandbox.id,
                provider = provider.name(),
                instance_id = %spawned.instance_id,
                status = %status,
                "Spawned sandbox"
            );
        }

        self.storage
            .find(&sandbox.id)
            .await?
            .ok_or(ManagerError::NotFound(sandbox.id))
    }

    /// Best-effort provider stop; local state is authoritative either way.
    async fn teardown(&self, sandbox: &Sandbox) {
        let Some(instance_id) = sandbox.instance_id.as_deref() else {
            return;
        };

        let provider: Arc<dyn Provider> = match self.providers.get(&sandbox.provider) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, "Cannot stop instance: {}", e);
                return;
            }
        };

        match provider.stop(instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(sandbox_id = %sandbox.id, instance_id, "Instance already gone");
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox.id, instance_id, "Provider stop failed: {}", e);
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

fn generate_callback_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

/// SHA-256 hex digest stored in place of the callback secret
pub fn callback_fingerprint(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use fleet_storage::memory_pool;
    use fleet_storage::scheduler::testing::RecordingScheduler;
    use pretty_assertions::assert_eq;

    struct Harness {
        manager: SandboxManager,
        provider: Arc<MockProvider>,
        scheduler: Arc<RecordingScheduler>,
    }

    async fn harness() -> Harness {
        let pool = memory_pool().await.unwrap();
        let provider = Arc::new(MockProvider::new().with_sandbox_url("http://127.0.0.1:9000"));
        let scheduler = Arc::new(RecordingScheduler::new());
        let registry = ProviderRegistry::new("mock").with_provider(provider.clone());
        let manager = SandboxManager::new(
            SandboxStorage::new(pool),
            registry,
            scheduler.clone(),
            LifecycleSettings {
                image: "img:test".to_string(),
                warm_ttl: Duration::from_secs(600),
                idle_timeout: Duration::from_secs(1800),
            },
        );
        Harness {
            manager,
            provider,
            scheduler,
        }
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = callback_fingerprint("secret");
        assert_eq!(a.len(), 64);
        assert_eq!(a, callback_fingerprint("secret"));
        assert_ne!(a, callback_fingerprint("other"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_spawn_records_running_sandbox() {
        let h = harness().await;
        let sandbox = h.manager.spawn("team_a").await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.provider, "mock");
        assert_eq!(sandbox.image, "img:test");
        assert_eq!(sandbox.sandbox_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(
            sandbox.instance_id.as_deref(),
            Some(format!("mock-{}", sandbox.id).as_str())
        );

        // Only the fingerprint of the secret handed to the provider is stored
        let config = &h.provider.spawned_configs()[0];
        let secret = &config.env_vars[FLEET_CALLBACK_SECRET];
        assert_eq!(config.env_vars[FLEET_SANDBOX_ID], sandbox.id);
        assert_eq!(
            sandbox.callback_fingerprint.as_deref(),
            Some(callback_fingerprint(secret).as_str())
        );
        assert_ne!(sandbox.callback_fingerprint.as_deref(), Some(secret.as_str()));
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_error() {
        let h = harness().await;
        h.provider.fail_spawn(true);

        let sandbox_id = match h.manager.spawn("team_a").await {
            Err(ManagerError::SpawnFailed { sandbox_id, .. }) => sandbox_id,
            other => panic!("expected SpawnFailed, got {other:?}"),
        };

        let record = h.manager.get(&sandbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Error);
        assert!(record.error_message.unwrap().contains("mock spawn failure"));
    }

    #[tokio::test]
    async fn test_prewarm_reserves_and_schedules_expiry() {
        let h = harness().await;

        let warm = h.manager.prewarm("team_a").await.unwrap();
        assert_eq!(warm.status, SandboxStatus::Paused);
        assert!(warm.is_warm());

        // A second prewarm reuses the live reservation
        let again = h.manager.prewarm("team_a").await.unwrap();
        assert_eq!(again.id, warm.id);
        assert_eq!(h.provider.spawn_count(), 1);

        let jobs = h.scheduler.jobs().await;
        assert_eq!(
            jobs,
            vec![(
                Duration::from_secs(600),
                ScheduledJob::ExpireWarm {
                    sandbox_id: warm.id.clone()
                }
            )]
        );

        // Another team gets its own sandbox
        let other = h.manager.prewarm("team_b").await.unwrap();
        assert_ne!(other.id, warm.id);
    }

    #[tokio::test]
    async fn test_expire_warm_is_idempotent() {
        let h = harness().await;
        let warm = h.manager.prewarm("team_a").await.unwrap();

        h.manager.expire_warm(&warm.id).await.unwrap();
        h.manager.expire_warm(&warm.id).await.unwrap();
        h.manager.expire_warm("sbx_missing").await.unwrap();

        assert_eq!(h.provider.stop_count(), 1);
        let record = h.manager.get(&warm.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn test_expire_after_claim_is_noop() {
        let h = harness().await;
        let warm = h.manager.prewarm("team_a").await.unwrap();

        let claimed = h.manager.claim_warm("team_a").await.unwrap().unwrap();
        assert_eq!(claimed.id, warm.id);
        assert_eq!(claimed.status, SandboxStatus::Running);

        h.manager.expire_warm(&warm.id).await.unwrap();
        assert_eq!(h.provider.stop_count(), 0);
        let record = h.manager.get(&warm.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_tolerates_provider_failure() {
        let h = harness().await;
        let sandbox = h.manager.spawn("team_a").await.unwrap();
        assert!(h.manager.attach(&sandbox.id).await.unwrap());

        h.provider.fail_stop(true);
        h.manager.stop(&sandbox.id).await.unwrap();

        let record = h.manager.get(&sandbox.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Stopped);
        assert_eq!(record.conversation_count, 0);

        // Stopping again, or stopping something unknown, does nothing
        h.manager.stop(&sandbox.id).await.unwrap();
        h.manager.stop("sbx_missing").await.unwrap();
        assert_eq!(h.provider.stop_count(), 1);

        assert!(!h.manager.attach(&sandbox.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_status_marks_vanished_instance_stopped() {
        let h = harness().await;
        let sandbox = h.manager.spawn("team_a").await.unwrap();
        let instance_id = sandbox.instance_id.clone().unwrap();

        h.provider
            .set_status(&instance_id, InstanceStatus::Error("oom".to_string()));
        let refreshed = h.manager.refresh_status(&sandbox.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, SandboxStatus::Error);

        let other = h.manager.spawn("team_a").await.unwrap();
        h.provider.forget(other.instance_id.as_deref().unwrap());
        let refreshed = h.manager.refresh_status(&other.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, SandboxStatus::Stopped);

        assert!(h.manager.refresh_status("sbx_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweeps() {
        let h = harness().await;
        let storage = h.manager.storage().clone();

        let warm = h.manager.prewarm("team_a").await.unwrap();
        let busy = h.manager.spawn("team_a").await.unwrap();
        let idle = h.manager.spawn("team_a").await.unwrap();
        h.manager.attach(&busy.id).await.unwrap();

        // Push the reservation and the activity clocks into the past
        let long_ago = fleet_storage::to_db_timestamp(&(Utc::now() - chrono::Duration::hours(2)));
        sqlx::query("UPDATE sandboxes SET reserved_until = ?1, last_activity_at = ?1")
            .bind(&long_ago)
            .execute(storage.pool())
            .await
            .unwrap();

        assert_eq!(h.manager.sweep_expired_warm().await.unwrap(), 1);
        assert_eq!(h.manager.sweep_idle().await.unwrap(), 1);

        let status = |id: String| {
            let storage = storage.clone();
            async move { storage.get(&id).await.unwrap().status }
        };
        assert_eq!(status(warm.id).await, SandboxStatus::Stopped);
        assert_eq!(status(busy.id).await, SandboxStatus::Running);
        assert_eq!(status(idle.id).await, SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn test_sweeper_run_once() {
        let h = harness().await;
        let manager = Arc::new(h.manager);
        let sweeper = crate::Sweeper::new(manager, Duration::from_secs(60));

        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report, crate::SweepReport::default());
        assert!(!sweeper.is_running().await);
    }
}
