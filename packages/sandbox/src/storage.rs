// ABOUTME: Storage layer for sandbox records
// ABOUTME: Check-then-act transitions are single conditional UPDATEs decided by rows_affected

use chrono::{DateTime, Utc};
use fleet_storage::{
    from_db_timestamp, from_db_timestamp_opt, to_db_timestamp, Result, StorageError,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Pending,
    Running,
    /// Warm: spawned ahead of demand and reserved for a team
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub provider: String,
    pub instance_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub status: SandboxStatus,
    pub team_id: Option<String>,
    /// SHA-256 hex of the callback secret, never the secret itself
    pub callback_fingerprint: Option<String>,
    pub image: String,
    pub conversation_count: u32,
    pub reserved_until: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    pub fn is_warm(&self) -> bool {
        self.status == SandboxStatus::Paused && self.reserved_until.is_some()
    }
}

const SANDBOX_COLUMNS: &str = "id, provider, instance_id, sandbox_url, status, team_id, \
    callback_fingerprint, image, conversation_count, reserved_until, error_message, \
    last_activity_at, created_at, stopped_at";

#[derive(Clone)]
pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, sandbox: &Sandbox) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, provider, instance_id, sandbox_url, status, team_id,
                callback_fingerprint, image, conversation_count, reserved_until,
                error_message, last_activity_at, created_at, stopped_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&sandbox.id)
        .bind(&sandbox.provider)
        .bind(&sandbox.instance_id)
        .bind(&sandbox.sandbox_url)
        .bind(sandbox.status.as_str())
        .bind(&sandbox.team_id)
        .bind(&sandbox.callback_fingerprint)
        .bind(&sandbox.image)
        .bind(sandbox.conversation_count as i64)
        .bind(sandbox.reserved_until.as_ref().map(to_db_timestamp))
        .bind(&sandbox.error_message)
        .bind(to_db_timestamp(&sandbox.last_activity_at))
        .bind(to_db_timestamp(&sandbox.created_at))
        .bind(sandbox.stopped_at.as_ref().map(to_db_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandboxes WHERE id = ?1",
            SANDBOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sandbox).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("sandbox {}", id)))
    }

    pub async fn list(&self, status: Option<SandboxStatus>) -> Result<Vec<Sandbox>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM sandboxes WHERE status = ?1 ORDER BY created_at DESC",
                    SANDBOX_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM sandboxes ORDER BY created_at DESC",
                    SANDBOX_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_sandbox).collect()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(SandboxStatus, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM sandboxes GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status = SandboxStatus::from_str(&row.get::<String, _>("status"))?;
                Ok((status, row.get::<i64, _>("total")))
            })
            .collect()
    }

    /// Record the provider instance for a pending sandbox. False if the record left
    /// `pending` while the provider call was in flight.
    pub async fn record_spawned(
        &self,
        id: &str,
        instance_id: &str,
        sandbox_url: Option<&str>,
        status: SandboxStatus,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET instance_id = ?1, sandbox_url = ?2, status = ?3, last_activity_at = ?4
            WHERE id = ?5 AND status = 'pending'
            "#,
        )
        .bind(instance_id)
        .bind(sandbox_url)
        .bind(status.as_str())
        .bind(to_db_timestamp(now))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'error', error_message = ?1, conversation_count = 0, reserved_until = NULL
            WHERE id = ?2
            "#,
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditional status change; returns whether the row was in `from`.
    pub async fn transition(
        &self,
        id: &str,
        from: SandboxStatus,
        to: SandboxStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE sandboxes SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(to.as_str())
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_url(&self, id: &str, sandbox_url: &str) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET sandbox_url = ?1 WHERE id = ?2")
            .bind(sandbox_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unexpired warm (or still spawning warm) sandbox already reserved for `team_id`
    pub async fn find_warm_for_team(
        &self,
        team_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<Option<Sandbox>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM sandboxes
            WHERE team_id = ?1
              AND status IN ('pending', 'paused')
              AND reserved_until IS NOT NULL
              AND reserved_until > ?2
            ORDER BY created_at ASC
            LIMIT 1
            "#,
            SANDBOX_COLUMNS
        ))
        .bind(team_id)
        .bind(to_db_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_sandbox).transpose()
    }

    /// Consume one of the team's unexpired warm sandboxes (paused -> running).
    pub async fn claim_warm(&self, team_id: &str, now: &DateTime<Utc>) -> Result<Option<String>> {
        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM sandboxes
            WHERE team_id = ?1 AND status = 'paused' AND reserved_until > ?2
            ORDER BY created_at ASC
            LIMIT 5
            "#,
        )
        .bind(team_id)
        .bind(to_db_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        for id in candidates {
            let result = sqlx::query(
                r#"
                UPDATE sandboxes
                SET status = 'running', reserved_until = NULL, last_activity_at = ?1
                WHERE id = ?2 AND status = 'paused'
                "#,
            )
            .bind(to_db_timestamp(now))
            .bind(&id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(id));
            }
        }

        Ok(None)
    }

    /// Begin tearing down a sandbox that is not already stopped. Clears the
    /// conversation count so nothing attaches to a stopping sandbox.
    pub async fn begin_stop(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'stopping', conversation_count = 0
            WHERE id = ?1 AND status NOT IN ('stopping', 'stopped')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Begin stopping a running sandbox only if it is still idle at `cutoff`.
    pub async fn begin_idle_stop(&self, id: &str, cutoff: &DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'stopping'
            WHERE id = ?1 AND status = 'running' AND conversation_count = 0
              AND last_activity_at <= ?2
            "#,
        )
        .bind(id)
        .bind(to_db_timestamp(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_stopped(&self, id: &str, now: &DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'stopped', stopped_at = ?1, conversation_count = 0, reserved_until = NULL
            WHERE id = ?2
            "#,
        )
        .bind(to_db_timestamp(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Increment the conversation count if the sandbox can still take conversations.
    pub async fn attach(&self, id: &str, now: &DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET conversation_count = conversation_count + 1, last_activity_at = ?1
            WHERE id = ?2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(to_db_timestamp(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn detach(&self, id: &str, now: &DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET conversation_count = MAX(conversation_count - 1, 0), last_activity_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(to_db_timestamp(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn touch(&self, id: &str, now: &DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sandboxes SET last_activity_at = ?1 WHERE id = ?2")
            .bind(to_db_timestamp(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn expired_warm_ids(&self, now: &DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM sandboxes
            WHERE status = 'paused' AND reserved_until IS NOT NULL AND reserved_until <= ?1
            ORDER BY reserved_until ASC
            "#,
        )
        .bind(to_db_timestamp(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn idle_running_ids(&self, cutoff: &DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM sandboxes
            WHERE status = 'running' AND conversation_count = 0 AND last_activity_at <= ?1
            ORDER BY last_activity_at ASC
            "#,
        )
        .bind(to_db_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn row_to_sandbox(row: sqlx::sqlite::SqliteRow) -> Result<Sandbox> {
    Ok(Sandbox {
        id: row.get("id"),
        provider: row.get("provider"),
        instance_id: row.get("instance_id"),
        sandbox_url: row.get("sandbox_url"),
        status: SandboxStatus::from_str(&row.get::<String, _>("status"))?,
        team_id: row.get("team_id"),
        callback_fingerprint: row.get("callback_fingerprint"),
        image: row.get("image"),
        conversation_count: row.get::<i64, _>("conversation_count").max(0) as u32,
        reserved_until: from_db_timestamp_opt(row.get("reserved_until"))?,
        error_message: row.get("error_message"),
        last_activity_at: from_db_timestamp(&row.get::<String, _>("last_activity_at"))?,
        created_at: from_db_timestamp(&row.get::<String, _>("created_at"))?,
        stopped_at: from_db_timestamp_opt(row.get("stopped_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_storage::memory_pool;

    fn sandbox(id: &str, status: SandboxStatus) -> Sandbox {
        let now = Utc::now();
        Sandbox {
            id: id.to_string(),
            provider: "docker".to_string(),
            instance_id: Some(format!("inst-{}", id)),
            sandbox_url: None,
            status,
            team_id: Some("team_a".to_string()),
            callback_fingerprint: None,
            image: "img".to_string(),
            conversation_count: 0,
            reserved_until: None,
            error_message: None,
            last_activity_at: now,
            created_at: now,
            stopped_at: None,
        }
    }

    async fn setup() -> SandboxStorage {
        SandboxStorage::new(memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let storage = setup().await;
        let record = sandbox("sbx_1", SandboxStatus::Pending);
        storage.create(&record).await.unwrap();

        let found = storage.find("sbx_1").await.unwrap().unwrap();
        assert_eq!(found.status, SandboxStatus::Pending);
        assert_eq!(found.team_id.as_deref(), Some("team_a"));
        assert!(storage.find("sbx_missing").await.unwrap().is_none());
        assert!(matches!(
            storage.get("sbx_missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_only_when_live_and_detach_floors_at_zero() {
        let storage = setup().await;
        let now = Utc::now();
        storage
            .create(&sandbox("sbx_live", SandboxStatus::Running))
            .await
            .unwrap();
        storage
            .create(&sandbox("sbx_done", SandboxStatus::Stopped))
            .await
            .unwrap();

        assert!(storage.attach("sbx_live", &now).await.unwrap());
        assert!(storage.attach("sbx_live", &now).await.unwrap());
        assert!(!storage.attach("sbx_done", &now).await.unwrap());
        assert!(!storage.attach("sbx_missing", &now).await.unwrap());

        for _ in 0..3 {
            storage.detach("sbx_live", &now).await.unwrap();
        }
        let live = storage.get("sbx_live").await.unwrap();
        assert_eq!(live.conversation_count, 0);
    }

    #[tokio::test]
    async fn test_claim_warm_respects_expiry_and_is_single_use() {
        let storage = setup().await;
        let now = Utc::now();

        let mut expired = sandbox("sbx_old", SandboxStatus::Paused);
        expired.reserved_until = Some(now - Duration::seconds(5));
        storage.create(&expired).await.unwrap();

        let mut fresh = sandbox("sbx_new", SandboxStatus::Paused);
        fresh.reserved_until = Some(now + Duration::seconds(600));
        storage.create(&fresh).await.unwrap();

        assert_eq!(
            storage.claim_warm("team_a", &now).await.unwrap().as_deref(),
            Some("sbx_new")
        );
        assert_eq!(storage.claim_warm("team_a", &now).await.unwrap(), None);
        assert_eq!(storage.claim_warm("team_b", &now).await.unwrap(), None);

        let claimed = storage.get("sbx_new").await.unwrap();
        assert_eq!(claimed.status, SandboxStatus::Running);
        assert!(claimed.reserved_until.is_none());

        assert_eq!(
            storage.expired_warm_ids(&now).await.unwrap(),
            vec!["sbx_old".to_string()]
        );
    }

    #[tokio::test]
    async fn test_begin_stop_zeroes_count_and_is_single_shot() {
        let storage = setup().await;
        let now = Utc::now();
        storage
            .create(&sandbox("sbx_1", SandboxStatus::Running))
            .await
            .unwrap();
        storage.attach("sbx_1", &now).await.unwrap();

        assert!(storage.begin_stop("sbx_1").await.unwrap());
        assert!(!storage.begin_stop("sbx_1").await.unwrap());

        let stopping = storage.get("sbx_1").await.unwrap();
        assert_eq!(stopping.status, SandboxStatus::Stopping);
        assert_eq!(stopping.conversation_count, 0);

        storage.mark_stopped("sbx_1", &now).await.unwrap();
        let stopped = storage.get("sbx_1").await.unwrap();
        assert_eq!(stopped.status, SandboxStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_record_spawned_requires_pending() {
        let storage = setup().await;
        let now = Utc::now();
        storage
            .create(&sandbox("sbx_1", SandboxStatus::Pending))
            .await
            .unwrap();

        assert!(storage
            .record_spawned("sbx_1", "c-1", Some("http://x"), SandboxStatus::Running, &now)
            .await
            .unwrap());
        assert!(!storage
            .record_spawned("sbx_1", "c-2", None, SandboxStatus::Running, &now)
            .await
            .unwrap());

        let record = storage.get("sbx_1").await.unwrap();
        assert_eq!(record.instance_id.as_deref(), Some("c-1"));
        assert_eq!(record.sandbox_url.as_deref(), Some("http://x"));
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let storage = setup().await;
        storage
            .create(&sandbox("sbx_1", SandboxStatus::Running))
            .await
            .unwrap();
        storage
            .create(&sandbox("sbx_2", SandboxStatus::Running))
            .await
            .unwrap();
        storage
            .create(&sandbox("sbx_3", SandboxStatus::Error))
            .await
            .unwrap();

        let counts = storage.count_by_status().await.unwrap();
        assert_eq!(
            counts,
            vec![(SandboxStatus::Error, 1), (SandboxStatus::Running, 2)]
        );
    }
}
