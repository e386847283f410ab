// ABOUTME: Routes due scheduled jobs to the delivery pipeline and lifecycle manager
// ABOUTME: Each due job runs on its own task so a slow delivery never holds up the queue

use fleet_conversations::{DeliveryOutcome, DeliveryPipeline};
use fleet_sandbox::SandboxManager;
use fleet_storage::{DueJob, ScheduledJob};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct JobDispatcher {
    pipeline: Arc<DeliveryPipeline>,
    sandboxes: Arc<SandboxManager>,
}

impl JobDispatcher {
    pub fn new(pipeline: Arc<DeliveryPipeline>, sandboxes: Arc<SandboxManager>) -> Self {
        Self {
            pipeline,
            sandboxes,
        }
    }

    /// Run one job to completion. Failures are logged, never propagated.
    pub async fn dispatch(&self, job: ScheduledJob) {
        match job {
            ScheduledJob::DeliverMessage {
                conversation_id,
                message_id,
                attempt,
            } => {
                match self
                    .pipeline
                    .deliver_message(&conversation_id, &message_id, attempt)
                    .await
                {
                    Ok(DeliveryOutcome::Rescheduled {
                        next_attempt,
                        delay,
                    }) => {
                        debug!(%message_id, next_attempt, ?delay, "Delivery rescheduled")
                    }
                    Ok(DeliveryOutcome::Failed) => {
                        warn!(%conversation_id, %message_id, attempt, "Delivery gave up")
                    }
                    Ok(outcome) => debug!(%message_id, ?outcome, "Delivery job finished"),
                    Err(e) => error!(%conversation_id, %message_id, attempt, "Delivery job failed: {}", e),
                }
            }
            ScheduledJob::ExpireWarm { sandbox_id } => {
                if let Err(e) = self.sandboxes.expire_warm(&sandbox_id).await {
                    error!(%sandbox_id, "Warm expiry failed: {}", e);
                }
            }
        }
    }

    /// Consume due jobs until the scheduler side of the channel closes.
    pub fn run(self, mut due: mpsc::UnboundedReceiver<DueJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Job dispatcher started");
            while let Some(DueJob { id, job }) = due.recv().await {
                debug!(%id, ?job, "Dispatching job");
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.dispatch(job).await });
            }
            info!("Job dispatcher stopped");
        })
    }
}
