// ABOUTME: Wires configuration, storage, providers, pipeline and orchestrator together
// ABOUTME: Backs the serve, sweep and status subcommands

use anyhow::{Context, Result};
use fleet_config::{FleetConfig, ProviderKind};
use fleet_conversations::{
    ConversationStore, DeliveryPipeline, DeliverySettings, HttpSandboxTransport,
    StaticTokenSource, TokenCache,
};
use fleet_extraction::ExtractionSettings;
use fleet_orchestrator::{ConversationConnector, JobDispatcher, Orchestrator, OrchestratorSettings};
use fleet_sandbox::{
    DockerProvider, LifecycleSettings, LocalProcessProvider, MicroVmProvider, ProviderRegistry,
    SandboxManager, SandboxStatus, SandboxStorage, SweepReport, Sweeper,
};
use fleet_storage::{DueJob, TokioScheduler};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub fn lifecycle_settings(config: &FleetConfig) -> LifecycleSettings {
    LifecycleSettings {
        image: config.sandbox_image.clone(),
        warm_ttl: config.warm_ttl,
        idle_timeout: config.idle_timeout,
    }
}

pub fn delivery_settings(config: &FleetConfig) -> DeliverySettings {
    DeliverySettings {
        max_attempts: config.delivery_max_attempts,
        base_delay: config.delivery_base_delay,
        max_delay: config.delivery_max_delay,
        ..DeliverySettings::default()
    }
}

pub fn orchestrator_settings(config: &FleetConfig) -> OrchestratorSettings {
    OrchestratorSettings {
        poll_interval: config.poll_interval,
        extraction: ExtractionSettings {
            dedup_prefix: config.dedup_prefix_chars,
            max_natural_questions: config.max_natural_questions,
        },
        ..OrchestratorSettings::default()
    }
}

/// Every provider the configuration allows. Only the default one is required.
pub fn build_providers(config: &FleetConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new(config.default_provider.as_str());

    match DockerProvider::new() {
        Ok(docker) => registry = registry.with_provider(Arc::new(docker)),
        Err(e) if config.default_provider == ProviderKind::Docker => {
            return Err(e).context("Docker provider unavailable");
        }
        Err(e) => warn!("Docker provider unavailable: {}", e),
    }

    if let Some(command) = &config.local_sandbox_command {
        let local = LocalProcessProvider::new(command.clone())
            .context("Invalid local sandbox command")?;
        registry = registry.with_provider(Arc::new(local));
    }

    if let Some(microvm) = &config.microvm {
        let provider = MicroVmProvider::new(microvm.api_url.clone(), microvm.api_key.clone())
            .context("Invalid micro-VM provider configuration")?;
        registry = registry.with_provider(Arc::new(provider));
    }

    registry
        .default_provider()
        .context("Default sandbox provider is not configured")?;
    info!(providers = ?registry.names(), default = registry.default_name(), "Sandbox providers ready");
    Ok(registry)
}

/// Long-lived services built from one configuration
pub struct Fleet {
    pub config: FleetConfig,
    pub manager: Arc<SandboxManager>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub scheduler: Arc<TokioScheduler>,
}

impl Fleet {
    /// Build the services; due scheduled jobs arrive on the returned receiver.
    pub async fn build(config: FleetConfig) -> Result<(Self, mpsc::UnboundedReceiver<DueJob>)> {
        let pool = fleet_storage::connect(&config.database_url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;
        let providers = build_providers(&config)?;
        let (scheduler, due) = TokioScheduler::new();
        let scheduler = Arc::new(scheduler);

        let manager = Arc::new(SandboxManager::new(
            SandboxStorage::new(pool.clone()),
            providers,
            scheduler.clone(),
            lifecycle_settings(&config),
        ));

        let tokens = TokenCache::new(Arc::new(StaticTokenSource::new(
            config.sandbox_token.clone(),
        )));
        let transport =
            HttpSandboxTransport::new(tokens).context("Failed to build sandbox HTTP client")?;

        let pipeline = Arc::new(DeliveryPipeline::new(
            ConversationStore::new(pool),
            manager.clone(),
            Arc::new(transport),
            scheduler.clone(),
            delivery_settings(&config),
        ));

        Ok((
            Self {
                config,
                manager,
                pipeline,
                scheduler,
            },
            due,
        ))
    }
}

/// Run dispatcher, sweeper and orchestrator until interrupted.
pub async fn serve(config: FleetConfig) -> Result<()> {
    let (fleet, due) = Fleet::build(config).await?;

    let resumed = fleet
        .pipeline
        .resume_pending_deliveries()
        .await
        .context("Failed to resume pending deliveries")?;
    if resumed > 0 {
        info!(resumed, "Rescheduled undelivered messages");
    }

    let dispatcher = JobDispatcher::new(fleet.pipeline.clone(), fleet.manager.clone()).run(due);

    let sweeper = Sweeper::new(fleet.manager.clone(), fleet.config.sweep_interval);
    let sweep_task = sweeper.start().await;

    let connector = Arc::new(ConversationConnector::new(fleet.pipeline.clone()));
    let (orchestrator, mut events) =
        Orchestrator::new(connector, orchestrator_settings(&fleet.config));
    let orchestrator = Arc::new(orchestrator);
    let poll_task = orchestrator.start().await;

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    info!(session_id = %event.session_id(), event = %payload, "Session event")
                }
                Err(e) => warn!("Failed to encode session event: {}", e),
            }
        }
    });

    info!("Fleet running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    orchestrator.stop().await;
    sweeper.stop().await;
    for task in [sweep_task, poll_task].into_iter().flatten() {
        task.abort();
    }
    event_log.abort();
    dispatcher.abort();
    Ok(())
}

/// Run both sweeps once.
pub async fn sweep(config: FleetConfig) -> Result<SweepReport> {
    let (fleet, _due) = Fleet::build(config).await?;
    let sweeper = Sweeper::new(fleet.manager.clone(), fleet.config.sweep_interval);
    sweeper.run_once().await.context("Sweep failed")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSummary {
    pub sandboxes: Vec<(SandboxStatus, i64)>,
    pub open_conversations: usize,
}

impl FleetSummary {
    pub fn to_json(&self) -> serde_json::Value {
        let sandboxes: serde_json::Map<String, serde_json::Value> = self
            .sandboxes
            .iter()
            .map(|(status, count)| (status.as_str().to_string(), json!(count)))
            .collect();
        json!({
            "sandboxes": sandboxes,
            "open_conversations": self.open_conversations,
        })
    }
}

pub async fn summarize(pool: &SqlitePool) -> Result<FleetSummary> {
    let sandboxes = SandboxStorage::new(pool.clone())
        .count_by_status()
        .await
        .context("Failed to count sandboxes")?;
    let open_conversations = ConversationStore::new(pool.clone())
        .list_open_conversations()
        .await
        .context("Failed to list conversations")?
        .len();

    Ok(FleetSummary {
        sandboxes,
        open_conversations,
    })
}

/// Counts straight from the database; needs no provider.
pub async fn status(config: &FleetConfig) -> Result<FleetSummary> {
    let pool = fleet_storage::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    summarize(&pool).await
}
