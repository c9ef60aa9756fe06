//! Session-scan persistence and the derived per-profile quota view.
//!
//! Scan runs record a sweep over a profile group; result rows capture each
//! profile's session/quota snapshot. The newest result per profile is the
//! dispatcher's candidate universe, optionally refreshed in place by live
//! quota observations from running jobs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::Store;

/// Snapshot written per profile during a scan or live observation.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub profile_name: Option<String>,
    pub session_status: String,
    pub plan_type: String,
    pub remaining_count: Option<i64>,
    pub total_count: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Latest known state of one profile, as the dispatcher sees it.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct ProfileState {
    pub profile_id: i64,
    pub profile_name: Option<String>,
    pub session_status: String,
    pub plan_type: String,
    pub remaining_count: Option<i64>,
    pub total_count: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}

impl Store {
    pub async fn create_scan_run(
        &self,
        group_title: &str,
        operator: Option<&str>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ixbrowser_scan_runs (group_title, status, total, ok_count, fail_count, operator_username, created_at)
            VALUES (?, 'running', 0, 0, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(group_title)
        .bind(operator)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    pub async fn finish_scan_run(
        &self,
        run_id: i64,
        status: &str,
        total: i64,
        ok_count: i64,
        fail_count: i64,
        message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ixbrowser_scan_runs
            SET status = ?, total = ?, ok_count = ?, fail_count = ?, message = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(total)
        .bind(ok_count)
        .bind(fail_count)
        .bind(message)
        .bind(Utc::now())
        .bind(run_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn insert_scan_result(
        &self,
        run_id: i64,
        group_title: &str,
        profile_id: i64,
        snapshot: &SessionSnapshot,
        snapshot_hash: Option<&str>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO ixbrowser_scan_results (
                run_id, group_title, profile_id, profile_name, session_status, plan_type,
                remaining_count, total_count, reset_at, cooldown_until, snapshot_hash, error, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(group_title)
        .bind(profile_id)
        .bind(&snapshot.profile_name)
        .bind(&snapshot.session_status)
        .bind(&snapshot.plan_type)
        .bind(snapshot.remaining_count)
        .bind(snapshot.total_count)
        .bind(snapshot.reset_at)
        .bind(snapshot.cooldown_until)
        .bind(snapshot_hash)
        .bind(&snapshot.error)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Newest result row per profile in the group. Profiles whose last scan
    /// errored are excluded: the dispatcher treats them as not present.
    pub async fn latest_profile_states(&self, group_title: &str) -> Result<Vec<ProfileState>> {
        let states = sqlx::query_as::<_, ProfileState>(
            r#"
            SELECT r.profile_id,
                   r.profile_name,
                   r.session_status,
                   r.plan_type,
                   r.remaining_count,
                   r.total_count,
                   r.reset_at,
                   r.cooldown_until,
                   r.created_at AS last_seen_at
            FROM ixbrowser_scan_results r
            JOIN (
                SELECT profile_id, MAX(id) AS max_id
                FROM ixbrowser_scan_results
                WHERE group_title = ?
                GROUP BY profile_id
            ) latest ON latest.max_id = r.id
            WHERE r.error IS NULL
            ORDER BY r.profile_id ASC
            "#,
        )
        .bind(group_title)
        .fetch_all(self.pool())
        .await?;
        Ok(states)
    }

    /// Refresh the newest result row for one profile with a live quota
    /// observation. Falls back to inserting a synthetic single-profile run
    /// when the group has never been scanned.
    pub async fn upsert_realtime_quota(
        &self,
        group_title: &str,
        profile_id: i64,
        snapshot: &SessionSnapshot,
    ) -> Result<()> {
        let latest_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM ixbrowser_scan_results
            WHERE group_title = ? AND profile_id = ?
            "#,
        )
        .bind(group_title)
        .bind(profile_id)
        .fetch_one(self.pool())
        .await?;

        match latest_id {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE ixbrowser_scan_results
                    SET session_status = ?,
                        plan_type = ?,
                        remaining_count = ?,
                        total_count = ?,
                        reset_at = COALESCE(?, reset_at),
                        cooldown_until = ?,
                        error = NULL,
                        created_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&snapshot.session_status)
                .bind(&snapshot.plan_type)
                .bind(snapshot.remaining_count)
                .bind(snapshot.total_count)
                .bind(snapshot.reset_at)
                .bind(snapshot.cooldown_until)
                .bind(Utc::now())
                .bind(id)
                .execute(self.pool())
                .await?;
            }
            None => {
                let run_id = self.create_scan_run(group_title, Some("realtime")).await?;
                self.insert_scan_result(run_id, group_title, profile_id, snapshot, None)
                    .await?;
                self.finish_scan_run(run_id, "completed", 1, 1, 0, Some("realtime observation"))
                    .await?;
            }
        }
        Ok(())
    }
}
