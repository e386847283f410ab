// ABOUTME: Delayed job scheduling for retries and warm-sandbox expiry
// ABOUTME: Jobs are armed on tokio timers and handed to a dispatcher over a channel when due

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Work that runs later, at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduledJob {
    DeliverMessage {
        conversation_id: String,
        message_id: String,
        attempt: u32,
    },
    ExpireWarm {
        sandbox_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduledId(pub u64);

impl std::fmt::Display for ScheduledId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Arrange for `job` to be dispatched after `delay`.
    async fn run_after(&self, delay: Duration, job: ScheduledJob) -> ScheduledId;

    /// Cancel a job that has not fired yet. Returns false if it already ran or never existed.
    async fn cancel(&self, id: ScheduledId) -> bool;
}

#[derive(Debug, Clone)]
pub struct DueJob {
    pub id: ScheduledId,
    pub job: ScheduledJob,
}

pub struct TokioScheduler {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<ScheduledId, JoinHandle<()>>>>,
    due_tx: mpsc::UnboundedSender<DueJob>,
}

impl TokioScheduler {
    /// Create the scheduler together with the receiving end that due jobs are sent to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DueJob>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        (
            Self {
                next_id: AtomicU64::new(1),
                pending: Arc::new(Mutex::new(HashMap::new())),
                due_tx,
            },
            due_rx,
        )
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn run_after(&self, delay: Duration, job: ScheduledJob) -> ScheduledId {
        let id = ScheduledId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, ?delay, ?job, "Scheduling job");

        // Hold the lock while spawning so the timer task cannot remove its entry before it exists
        let mut pending = self.pending.lock().await;
        let pending_map = self.pending.clone();
        let due_tx = self.due_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending_map.lock().await.remove(&id);
            if due_tx.send(DueJob { id, job }).is_err() {
                debug!(%id, "Dispatcher gone, dropping due job");
            }
        });

        pending.insert(id, handle);
        id
    }

    async fn cancel(&self, id: ScheduledId) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(handle) => {
                handle.abort();
                debug!(%id, "Cancelled scheduled job");
                true
            }
            None => false,
        }
    }
}

/// Scheduler double that records jobs instead of running them.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    #[derive(Default)]
    pub struct RecordingScheduler {
        next_id: AtomicU64,
        jobs: Mutex<Vec<(ScheduledId, Duration, ScheduledJob)>>,
    }

    impl RecordingScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn jobs(&self) -> Vec<(Duration, ScheduledJob)> {
            self.jobs
                .lock()
                .await
                .iter()
                .map(|(_, delay, job)| (*delay, job.clone()))
                .collect()
        }

        /// Remove and return everything recorded so far.
        pub async fn take(&self) -> Vec<(Duration, ScheduledJob)> {
            self.jobs
                .lock()
                .await
                .drain(..)
                .map(|(_, delay, job)| (delay, job))
                .collect()
        }
    }

    #[async_trait]
    impl Scheduler for RecordingScheduler {
        async fn run_after(&self, delay: Duration, job: ScheduledJob) -> ScheduledId {
            let id = ScheduledId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            self.jobs.lock().await.push((id, delay, job));
            id
        }

        async fn cancel(&self, id: ScheduledId) -> bool {
            let mut jobs = self.jobs.lock().await;
            let before = jobs.len();
            jobs.retain(|(job_id, _, _)| *job_id != id);
            jobs.len() != before
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expire(id: &str) -> ScheduledJob {
        ScheduledJob::ExpireWarm {
            sandbox_id: id.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_is_dispatched_after_delay() {
        let (scheduler, mut due) = TokioScheduler::new();

        let id = scheduler
            .run_after(Duration::from_secs(30), expire("sbx_1"))
            .await;
        assert_eq!(scheduler.pending_count().await, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(due.try_recv().is_err());

        let fired = due.recv().await.unwrap();
        assert_eq!(fired.id, id);
        assert_eq!(fired.job, expire("sbx_1"));
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_fires() {
        let (scheduler, mut due) = TokioScheduler::new();

        let cancelled = scheduler
            .run_after(Duration::from_secs(5), expire("sbx_cancel"))
            .await;
        let kept = scheduler
            .run_after(Duration::from_secs(10), expire("sbx_keep"))
            .await;

        assert!(scheduler.cancel(cancelled).await);
        assert!(!scheduler.cancel(cancelled).await);

        let fired = due.recv().await.unwrap();
        assert_eq!(fired.id, kept);
        assert!(due.try_recv().is_err());
    }

    #[test]
    fn test_job_serializes_with_tag() {
        let job = ScheduledJob::DeliverMessage {
            conversation_id: "conv_1".to_string(),
            message_id: "msg_1".to_string(),
            attempt: 2,
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "deliver_message");
        assert_eq!(json["attempt"], 2);
    }
}
