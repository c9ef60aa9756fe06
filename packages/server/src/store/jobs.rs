//! sora_jobs: creation, listing, the lease protocol, and retry-chain queries.
//!
//! `claim_next_job` is a single UPDATE-with-subselect so concurrent claimers
//! are serialised by SQLite's writer lock: each eligible row goes to exactly
//! one caller.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::Row;

use super::Store;
use crate::kernel::jobs::job::{JobPhase, JobStatus, NewJob, SoraJob, WatermarkStatus};

/// Filters for the job list endpoint.
#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub phase: Option<JobPhase>,
    pub profile_id: Option<i64>,
    pub group_title: Option<String>,
    pub keyword: Option<String>,
    pub limit: i64,
}

impl Store {
    pub async fn create_sora_job(&self, new: &NewJob) -> Result<SoraJob> {
        let now = Utc::now();
        let job = sqlx::query_as::<_, SoraJob>(
            r#"
            INSERT INTO sora_jobs (
                profile_id, group_title, prompt, image_url, duration, aspect_ratio,
                status, phase, progress_pct,
                retry_of_job_id, retry_root_job_id, retry_index,
                run_attempt, watermark_attempts,
                operator_username, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 'queued', 'queue', 0, ?, ?, ?, 0, 0, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(new.profile_id.unwrap_or(0))
        .bind(&new.group_title)
        .bind(&new.prompt)
        .bind(&new.image_url)
        .bind(new.duration)
        .bind(new.aspect_ratio)
        .bind(new.retry_of_job_id)
        .bind(new.retry_root_job_id)
        .bind(new.retry_index)
        .bind(&new.operator_username)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .context("failed to insert job")?;
        Ok(job)
    }

    pub async fn get_sora_job(&self, job_id: i64) -> Result<Option<SoraJob>> {
        let job = sqlx::query_as::<_, SoraJob>("SELECT * FROM sora_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(job)
    }

    pub async fn list_sora_jobs(&self, filter: &JobListFilter) -> Result<Vec<SoraJob>> {
        let limit = filter.limit.clamp(1, 500);
        let mut sql = String::from("SELECT * FROM sora_jobs WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.phase.is_some() {
            sql.push_str(" AND phase = ?");
        }
        if filter.profile_id.is_some() {
            sql.push_str(" AND profile_id = ?");
        }
        if filter.group_title.is_some() {
            sql.push_str(" AND group_title = ?");
        }
        if filter.keyword.is_some() {
            sql.push_str(" AND (prompt LIKE ? OR publish_url LIKE ?)");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, SoraJob>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status);
        }
        if let Some(phase) = filter.phase {
            query = query.bind(phase);
        }
        if let Some(profile_id) = filter.profile_id {
            query = query.bind(profile_id);
        }
        if let Some(group) = &filter.group_title {
            query = query.bind(group.clone());
        }
        if let Some(keyword) = &filter.keyword {
            let pattern = format!("%{}%", keyword);
            query = query.bind(pattern.clone()).bind(pattern);
        }
        let jobs = query.bind(limit).fetch_all(self.pool()).await?;
        Ok(jobs)
    }

    // ------------------------------------------------------------------
    // Lease protocol
    // ------------------------------------------------------------------

    /// Atomically claim the lowest-id eligible queued job for `owner`.
    ///
    /// Sets the row running, stamps the lease and heartbeat, bumps
    /// `run_attempt`, and clears `run_last_error`. Returns `None` when the
    /// queue is empty.
    pub async fn claim_next_sora_job(
        &self,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<Option<SoraJob>> {
        let now = Utc::now();
        let lease_until = now + Duration::seconds(lease_seconds.max(10));
        let job = sqlx::query_as::<_, SoraJob>(
            r#"
            UPDATE sora_jobs
            SET status = 'running',
                lease_owner = ?,
                lease_until = ?,
                heartbeat_at = ?,
                run_attempt = run_attempt + 1,
                run_last_error = NULL,
                started_at = COALESCE(started_at, ?),
                updated_at = ?
            WHERE id = (
                SELECT id FROM sora_jobs
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
        .bind(now)
        .fetch_optional(self.pool())
        .await?;
        Ok(job)
    }

    /// Extend the lease; succeeds only while `owner` still holds it.
    pub async fn heartbeat_sora_job_lease(
        &self,
        job_id: i64,
        owner: &str,
        lease_seconds: i64,
    ) -> Result<bool> {
        let now = Utc::now();
        let lease_until = now + Duration::seconds(lease_seconds.max(10));
        let result = sqlx::query(
            r#"
            UPDATE sora_jobs
            SET heartbeat_at = ?, lease_until = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(job_id)
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Null the lease fields iff `owner` holds the lease. Idempotent.
    pub async fn clear_sora_job_lease(&self, job_id: i64, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sora_jobs
            SET lease_owner = NULL, lease_until = NULL, heartbeat_at = NULL, updated_at = ?
            WHERE id = ? AND lease_owner = ?
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .bind(owner)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Recycle running rows whose lease expired (crashed workers).
    /// Keeps `run_attempt` so the claim history stays visible.
    pub async fn requeue_stale_sora_jobs(&self) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sora_jobs
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

    // ------------------------------------------------------------------
    // Row updates issued by the runner
    // ------------------------------------------------------------------

    pub async fn set_job_phase(&self, job_id: i64, phase: JobPhase) -> Result<()> {
        sqlx::query("UPDATE sora_jobs SET phase = ?, updated_at = ? WHERE id = ?")
            .bind(phase)
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Progress only moves forward within a claim.
    pub async fn set_job_progress(&self, job_id: i64, progress_pct: f64) -> Result<()> {
        sqlx::query(
            "UPDATE sora_jobs SET progress_pct = MAX(progress_pct, ?), updated_at = ? WHERE id = ?",
        )
        .bind(progress_pct.clamp(0.0, 100.0))
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_job_task(&self, job_id: i64, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE sora_jobs SET task_id = ?, updated_at = ? WHERE id = ?")
            .bind(task_id)
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_job_generation(&self, job_id: i64, generation_id: &str) -> Result<()> {
        sqlx::query("UPDATE sora_jobs SET generation_id = ?, updated_at = ? WHERE id = ?")
            .bind(generation_id)
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_job_publish(
        &self,
        job_id: i64,
        publish_url: &str,
        post_id: Option<&str>,
        permalink: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sora_jobs
            SET publish_url = ?, publish_post_id = ?, publish_permalink = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(publish_url)
        .bind(post_id)
        .bind(permalink)
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the dispatcher's choice and audit fields on the job row.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_job_dispatch(
        &self,
        job_id: i64,
        profile_id: i64,
        mode: &str,
        score: f64,
        quantity_score: f64,
        quality_score: f64,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sora_jobs
            SET profile_id = ?,
                dispatch_mode = ?,
                dispatch_score = ?,
                dispatch_quantity_score = ?,
                dispatch_quality_score = ?,
                dispatch_reason = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(profile_id)
        .bind(mode)
        .bind(score)
        .bind(quantity_score)
        .bind(quality_score)
        .bind(reason)
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_job_watermark(
        &self,
        job_id: i64,
        status: WatermarkStatus,
        url: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sora_jobs
            SET watermark_status = ?,
                watermark_url = COALESCE(?, watermark_url),
                watermark_error = ?,
                watermark_attempts = watermark_attempts + CASE WHEN ? IN ('running') THEN 1 ELSE 0 END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(url)
        .bind(error)
        .bind(status)
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_job_run_last_error(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE sora_jobs SET run_last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Write a terminal status. Terminal rows drop their lease so invariant
    /// "terminal implies no lease" holds regardless of worker unwind order.
    /// No-op when the row is already terminal.
    pub async fn finish_sora_job(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE sora_jobs
            SET status = ?,
                phase = CASE WHEN ? = 'completed' THEN 'done' ELSE phase END,
                error = COALESCE(?, error),
                finished_at = ?,
                lease_owner = NULL,
                lease_until = NULL,
                heartbeat_at = NULL,
                updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'canceled')
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cooperative cancellation: flips non-terminal rows only. Idempotent.
    pub async fn cancel_sora_job(&self, job_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sora_jobs
            SET status = 'canceled', finished_at = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'canceled')
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(job_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_sora_job_canceled(&self, job_id: i64) -> Result<bool> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM sora_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(matches!(status.as_deref(), Some("canceled")))
    }

    // ------------------------------------------------------------------
    // Retry chain + dispatch counters
    // ------------------------------------------------------------------

    /// Every profile already tried in a retry chain (root included).
    pub async fn list_retry_chain_profile_ids(&self, root_job_id: i64) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT profile_id
            FROM sora_jobs
            WHERE (id = ? OR retry_root_job_id = ?)
              AND profile_id > 0
            "#,
        )
        .bind(root_job_id)
        .bind(root_job_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(|row| row.get::<i64, _>(0)).collect())
    }

    pub async fn max_retry_index(&self, root_job_id: i64) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(retry_index)
            FROM sora_jobs
            WHERE id = ? OR retry_root_job_id = ?
            "#,
        )
        .bind(root_job_id)
        .bind(root_job_id)
        .fetch_one(self.pool())
        .await?;
        Ok(max.unwrap_or(0))
    }

    /// Running/queued jobs per profile, for the active-load penalty.
    pub async fn count_active_jobs_by_profile(
        &self,
        group_title: &str,
    ) -> Result<HashMap<i64, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT profile_id, COUNT(*) AS cnt
            FROM sora_jobs
            WHERE group_title = ?
              AND status IN ('queued', 'running')
            GROUP BY profile_id
            "#,
        )
        .bind(group_title)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<i64, _>(1)))
            .collect())
    }

    /// Jobs enqueued for a profile that have not yet reached the upstream
    /// (no task_id). These reserve quota before submission.
    pub async fn count_pending_submits_by_profile(
        &self,
        group_title: &str,
    ) -> Result<HashMap<i64, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT profile_id, COUNT(*) AS cnt
            FROM sora_jobs
            WHERE group_title = ?
              AND status IN ('queued', 'running')
              AND (task_id IS NULL OR TRIM(task_id) = '')
            GROUP BY profile_id
            "#,
        )
        .bind(group_title)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<i64, _>(0), row.get::<i64, _>(1)))
            .collect())
    }
}
