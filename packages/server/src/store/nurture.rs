//! Nurture batches: warm-up sweeps over a set of profiles. The batch rows
//! mirror the job lease columns so crash recovery works identically.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::Store;

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct NurtureBatch {
    pub id: i64,
    pub group_title: Option<String>,
    pub title: Option<String>,
    pub status: String,
    pub total: i64,
    pub ok_count: i64,
    pub fail_count: i64,
    pub warmup_seconds: i64,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub run_attempt: i64,
    pub run_last_error: Option<String>,
    pub operator_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct NurtureJob {
    pub id: i64,
    pub batch_id: i64,
    pub profile_id: i64,
    pub status: String,
    pub phase: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Insert a batch with its children atomically: readers never observe
    /// a batch with a partial child list.
    pub async fn create_nurture_batch(
        &self,
        group_title: Option<&str>,
        title: Option<&str>,
        profile_ids: &[i64],
        warmup_seconds: i64,
        operator: Option<&str>,
    ) -> Result<NurtureBatch> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let batch = sqlx::query_as::<_, NurtureBatch>(
            r#"
            INSERT INTO sora_nurture_batches (
                group_title, title, status, total, ok_count, fail_count,
                warmup_seconds, run_attempt, operator_username, created_at, updated_at
            )
            VALUES (?, ?, 'queued', ?, 0, 0, ?, 0, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(group_title)
        .bind(title)
        .bind(profile_ids.len() as i64)
        .bind(warmup_seconds.max(1))
        .bind(operator)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for profile_id in profile_ids {
            sqlx::query(
                r#"
                INSERT INTO sora_nurture_jobs (batch_id, profile_id, status, phase, created_at, updated_at)
                VALUES (?, ?, 'queued', 'queue', ?, ?)
                "#,
            )
            .bind(batch.id)
            .bind(profile_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(batch)
    }

    pub async fn get_nurture_batch(&self, batch_id: i64) -> Result<Option<NurtureBatch>> {
        let batch =
            sqlx::query_as::<_, NurtureBatch>("SELECT * FROM sora_nurture_batches WHERE id = ?")
                .bind(batch_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(batch)
    }

    pub async fn list_nurture_jobs(&self, batch_id: i64) -> Result<Vec<NurtureJob>> {
        let jobs = sqlx::query_as::<_, NurtureJob>(
            "SELECT * FROM sora_nurture_jobs WHERE batch_id = ? ORDER BY id ASC",
        )
        .bind(batch_id)
        .fetch_all(self.pool())
        .await?;
        Ok(jobs)
    }

    pub async fn update_nurture_job(
        &self,
        job_id: i64,
        status: &str,
        phase: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE sora_nurture_jobs
            SET status = ?,
                phase = ?,
                error = ?,
                started_at = CASE WHEN ? = 'running' THEN COALESCE(started_at, ?) ELSE started_at END,
                finished_at = CASE WHEN ? IN ('completed', 'failed') THEN ? ELSE finished_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(phase)
        .bind(error)
        .bind(status)
        .bind(now)
        .bind(status)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn finish_nurture_batch(
        &self,
        batch_id: i64,
        status: &str,
        ok_count: i64,
        fail_count: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE sora_nurture_batches
            SET status = ?, ok_count = ?, fail_count = ?, error = ?,
                lease_owner = NULL, lease_until = NULL, heartbeat_at = NULL,
                finished_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(ok_count)
        .bind(fail_count)
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(batch_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_nurture_batch_error(&self, batch_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sora_nurture_batches SET run_last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // Same lease protocol as sora_jobs.

    pub async fn claim_next_nurture_batch(
        &self,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<Option<NurtureBatch>> {
        let now = Utc::now();
        let lease_until = now + Duration::seconds(lease_seconds.max(10));
        let batch = sqlx::query_as::<_, NurtureBatch>(
            r#"
            UPDATE sora_nurture_batches
            SET status = 'running',
                lease_owner = ?,
                lease_until = ?,
                heartbeat_at = ?,
                run_attempt = run_attempt + 1,
                run_last_error = NULL,
                updated_at = ?
            WHERE id = (
                SELECT id FROM sora_nurture_batches
                WHERE status = 'queued'
                  AND (lease_until IS NULL OR lease_until < ?)
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(batch)
    }

    pub async fn heartbeat_nurture_batch_lease(
        &self,
        batch_id: i64,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let lease_until = now + Duration::seconds(lease_seconds.max(10));
        let result = sqlx::query(
            r#"
            UPDATE sora_nurture_batches
            SET heartbeat_at = ?, lease_until = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(batch_id)
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_nurture_batch_lease(&self, batch_id: i64, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sora_nurture_batches
            SET lease_owner = NULL, lease_until = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(Utc::now())
        .bind(batch_id)
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn requeue_stale_nurture_batches(&self) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sora_nurture_batches
            SET status = 'queued',
                lease_owner = NULL,
                lease_until = NULL,
                heartbeat_at = NULL,
                run_last_error = COALESCE(run_last_error, 'worker lease expired'),
                updated_at = ?
            WHERE status = 'running'
              AND lease_until IS NOT NULL
              AND lease_until < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
