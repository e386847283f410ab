// ABOUTME: Background sweeper for lapsed warm reservations and idle sandboxes
// ABOUTME: Periodically runs the lifecycle manager's expiry and idle sweeps

use crate::manager::{Result, SandboxManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_warm: usize,
    pub stopped_idle: usize,
}

pub struct Sweeper {
    manager: Arc<SandboxManager>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl Sweeper {
    pub fn new(manager: Arc<SandboxManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Run both sweeps once.
    pub async fn run_once(&self) -> Result<SweepReport> {
        sweep(&self.manager).await
    }

    /// Start the sweep loop. Returns `None` if it is already running.
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        let mut running = self.running.write().await;
        if *running {
            return None;
        }
        *running = true;
        drop(running);

        let manager = self.manager.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;

        Some(tokio::spawn(async move {
            info!(?interval, "Sandbox sweeper started");

            loop {
                if !*running_flag.read().await {
                    info!("Sandbox sweeper stopped");
                    break;
                }

                match sweep(&manager).await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(
                            expired_warm = report.expired_warm,
                            stopped_idle = report.stopped_idle,
                            "Sweep completed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Sweep failed: {}", e),
                }

                time::sleep(interval).await;
            }
        }))
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn sweep(manager: &SandboxManager) -> Result<SweepReport> {
    let expired_warm = manager.sweep_expired_warm().await?;
    let stopped_idle = manager.sweep_idle().await?;
    Ok(SweepReport {
        expired_warm,
        stopped_idle,
    })
}
