//! event_logs: the append-only structured log behind job history, the admin
//! list/stats endpoints, and the SSE stream. Retention (time + size) runs
//! opportunistically inside `create_event_log`, gated by an interval.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::Store;
use crate::common::mask::{mask_json, mask_text, MaskMode};
use crate::common::page::{parse_cursor, CursorPage};

/// Retention and masking knobs, derived from SystemSettings.logging.
#[derive(Debug, Clone)]
pub struct LogPolicy {
    pub retention_days: i64,
    pub cleanup_interval_sec: u64,
    pub max_mb: i64,
    pub mask_mode: MaskMode,
    pub audit_retention_days: i64,
    pub audit_cleanup_interval_sec: u64,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_sec: 3600,
            max_mb: 100,
            mask_mode: MaskMode::Basic,
            audit_retention_days: 3,
            audit_cleanup_interval_sec: 3600,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct EventLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub action: String,
    pub event: Option<String>,
    pub phase: Option<String>,
    pub status: String,
    pub level: String,
    pub message: Option<String>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub query_text: Option<String>,
    pub status_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub is_slow: bool,
    pub operator_username: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub error_type: Option<String>,
    pub error_code: Option<String>,
    pub metadata_json: Option<String>,
}

/// One durable event. `source`, `action`, `status`, `level` are required;
/// everything else depends on the emitter.
#[derive(Debug, Clone, Serialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewEventLog {
    pub source: String,
    pub action: String,
    #[builder(default = "success".to_string())]
    pub status: String,
    #[builder(default = "INFO".to_string())]
    pub level: String,
    #[builder(default)]
    pub event: Option<String>,
    #[builder(default)]
    pub phase: Option<String>,
    #[builder(default)]
    pub message: Option<String>,
    #[builder(default)]
    pub trace_id: Option<String>,
    #[builder(default)]
    pub request_id: Option<String>,
    #[builder(default)]
    pub method: Option<String>,
    #[builder(default)]
    pub path: Option<String>,
    #[builder(default)]
    pub query_text: Option<String>,
    #[builder(default)]
    pub status_code: Option<i64>,
    #[builder(default)]
    pub duration_ms: Option<i64>,
    #[builder(default = false)]
    pub is_slow: bool,
    #[builder(default)]
    pub operator_username: Option<String>,
    #[builder(default)]
    pub ip: Option<String>,
    #[builder(default)]
    pub user_agent: Option<String>,
    #[builder(default)]
    pub resource_type: Option<String>,
    #[builder(default)]
    pub resource_id: Option<String>,
    #[builder(default)]
    pub error_type: Option<String>,
    #[builder(default)]
    pub error_code: Option<String>,
    #[builder(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct EventLogFilter {
    pub source: Option<String>,
    pub status: Option<String>,
    pub level: Option<String>,
    pub operator: Option<String>,
    pub keyword: Option<String>,
    pub action: Option<String>,
    pub path: Option<String>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub slow_only: bool,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyCount {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventLogStats {
    pub total_count: i64,
    pub failed_count: i64,
    pub failure_rate: f64,
    pub p95_duration_ms: Option<i64>,
    pub slow_count: i64,
    pub source_distribution: Vec<KeyCount>,
    pub top_actions: Vec<KeyCount>,
    pub top_failed_reasons: Vec<KeyCount>,
}

fn push_filters(sql: &mut String, filter: &EventLogFilter) {
    if filter.source.is_some() {
        sql.push_str(" AND source = ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if filter.level.is_some() {
        sql.push_str(" AND level = ?");
    }
    if filter.operator.is_some() {
        sql.push_str(" AND operator_username = ?");
    }
    if filter.keyword.is_some() {
        sql.push_str(" AND (message LIKE ? OR action LIKE ? OR path LIKE ?)");
    }
    if filter.action.is_some() {
        sql.push_str(" AND action = ?");
    }
    if filter.path.is_some() {
        sql.push_str(" AND path LIKE ?");
    }
    if filter.trace_id.is_some() {
        sql.push_str(" AND trace_id = ?");
    }
    if filter.request_id.is_some() {
        sql.push_str(" AND request_id = ?");
    }
    if filter.start_at.is_some() {
        sql.push_str(" AND created_at >= ?");
    }
    if filter.end_at.is_some() {
        sql.push_str(" AND created_at <= ?");
    }
    if filter.slow_only {
        sql.push_str(" AND is_slow = 1");
    }
    if filter.resource_type.is_some() {
        sql.push_str(" AND resource_type = ?");
    }
    if filter.resource_id.is_some() {
        sql.push_str(" AND resource_id = ?");
    }
}

fn bind_filters<'q, O>(
    mut query: sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q EventLogFilter,
) -> sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(source) = &filter.source {
        query = query.bind(source);
    }
    if let Some(status) = &filter.status {
        query = query.bind(status);
    }
    if let Some(level) = &filter.level {
        query = query.bind(level);
    }
    if let Some(operator) = &filter.operator {
        query = query.bind(operator);
    }
    if let Some(keyword) = &filter.keyword {
        let pattern = format!("%{}%", keyword);
        query = query.bind(pattern.clone()).bind(pattern.clone()).bind(pattern);
    }
    if let Some(action) = &filter.action {
        query = query.bind(action);
    }
    if let Some(path) = &filter.path {
        query = query.bind(format!("%{}%", path));
    }
    if let Some(trace_id) = &filter.trace_id {
        query = query.bind(trace_id);
    }
    if let Some(request_id) = &filter.request_id {
        query = query.bind(request_id);
    }
    if let Some(start_at) = filter.start_at {
        query = query.bind(start_at);
    }
    if let Some(end_at) = filter.end_at {
        query = query.bind(end_at);
    }
    if let Some(resource_type) = &filter.resource_type {
        query = query.bind(resource_type);
    }
    if let Some(resource_id) = &filter.resource_id {
        query = query.bind(resource_id);
    }
    query
}

impl Store {
    /// Single entrypoint for durable events. Masks sensitive values,
    /// appends the row, then opportunistically enforces retention.
    pub async fn create_event_log(&self, new: NewEventLog) -> Result<i64> {
        let policy = self.log_policy();
        let message = new
            .message
            .as_deref()
            .map(|text| mask_text(policy.mask_mode, text));
        let query_text = new
            .query_text
            .as_deref()
            .map(|text| mask_text(policy.mask_mode, text));
        let metadata_json = new
            .metadata
            .as_ref()
            .map(|value| mask_json(policy.mask_mode, value).to_string());

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_logs (
                created_at, source, action, event, phase, status, level, message,
                trace_id, request_id, method, path, query_text, status_code,
                duration_ms, is_slow, operator_username, ip, user_agent,
                resource_type, resource_id, error_type, error_code, metadata_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(&new.source)
        .bind(&new.action)
        .bind(&new.event)
        .bind(&new.phase)
        .bind(&new.status)
        .bind(&new.level)
        .bind(message)
        .bind(&new.trace_id)
        .bind(&new.request_id)
        .bind(&new.method)
        .bind(&new.path)
        .bind(query_text)
        .bind(new.status_code)
        .bind(new.duration_ms)
        .bind(new.is_slow)
        .bind(&new.operator_username)
        .bind(&new.ip)
        .bind(&new.user_agent)
        .bind(&new.resource_type)
        .bind(&new.resource_id)
        .bind(&new.error_type)
        .bind(&new.error_code)
        .bind(metadata_json)
        .fetch_one(self.pool())
        .await?;

        self.maybe_cleanup_event_logs(&policy).await;
        Ok(id)
    }

    pub async fn list_event_logs(
        &self,
        filter: &EventLogFilter,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<CursorPage<EventLog>> {
        let safe_limit = limit.clamp(1, 500) as usize;
        let cursor_id = parse_cursor(cursor);

        let mut sql = String::from("SELECT * FROM event_logs WHERE 1=1");
        push_filters(&mut sql, filter);
        if cursor_id.is_some() {
            sql.push_str(" AND id < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, EventLog>(&sql);
        query = bind_filters(query, filter);
        if let Some(id) = cursor_id {
            query = query.bind(id);
        }
        let rows = query
            .bind((safe_limit + 1) as i64)
            .fetch_all(self.pool())
            .await?;

        Ok(CursorPage::from_rows(rows, safe_limit, |row| row.id))
    }

    /// Rows appended after `after_id`, oldest first. Feeds the SSE stream.
    pub async fn list_event_logs_since(
        &self,
        after_id: i64,
        source: Option<&str>,
        limit: i64,
    ) -> Result<Vec<EventLog>> {
        let mut sql = String::from("SELECT * FROM event_logs WHERE id > ?");
        if source.is_some() {
            sql.push_str(" AND source = ?");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?");

        let mut query = sqlx::query_as::<_, EventLog>(&sql).bind(after_id);
        if let Some(source) = source {
            query = query.bind(source);
        }
        let rows = query.bind(limit.clamp(1, 1000)).fetch_all(self.pool()).await?;
        Ok(rows)
    }

    pub async fn latest_event_log_id(&self) -> Result<i64> {
        let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM event_logs")
            .fetch_one(self.pool())
            .await?;
        Ok(id.unwrap_or(0))
    }

    pub async fn stats_event_logs(&self, filter: &EventLogFilter) -> Result<EventLogStats> {
        let mut base = String::new();
        push_filters(&mut base, filter);

        #[derive(FromRow)]
        struct Totals {
            total_count: i64,
            failed_count: Option<i64>,
            slow_count: Option<i64>,
        }

        let sql = format!(
            r#"
            SELECT COUNT(*) AS total_count,
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed_count,
                   SUM(CASE WHEN is_slow = 1 THEN 1 ELSE 0 END) AS slow_count
            FROM event_logs WHERE 1=1{}
            "#,
            base
        );
        let totals = bind_filters(sqlx::query_as::<_, Totals>(&sql), filter)
            .fetch_one(self.pool())
            .await?;
        let total_count = totals.total_count;
        let failed_count = totals.failed_count.unwrap_or(0);
        let slow_count = totals.slow_count.unwrap_or(0);
        let failure_rate = if total_count > 0 {
            (failed_count as f64 / total_count as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        // p95 over recorded durations; NTILE would be nicer but this keeps
        // the query portable across old SQLite builds.
        let sql = format!(
            "SELECT duration_ms FROM event_logs WHERE 1=1{} AND duration_ms IS NOT NULL ORDER BY duration_ms ASC",
            base
        );
        let durations: Vec<i64> = bind_filters(sqlx::query_as::<_, (i64,)>(&sql), filter)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(|(value,)| value)
            .collect();
        let p95_duration_ms = if durations.is_empty() {
            None
        } else {
            let idx = ((durations.len() as f64 * 0.95).ceil() as usize).max(1) - 1;
            Some(durations[idx])
        };

        let sql = format!(
            "SELECT source AS key, COUNT(*) AS count FROM event_logs WHERE 1=1{} GROUP BY source ORDER BY count DESC, key ASC",
            base
        );
        let source_distribution = bind_filters(sqlx::query_as::<_, (String, i64)>(&sql), filter)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect();

        let sql = format!(
            "SELECT action AS key, COUNT(*) AS count FROM event_logs WHERE 1=1{} GROUP BY action ORDER BY count DESC, key ASC LIMIT 5",
            base
        );
        let top_actions = bind_filters(sqlx::query_as::<_, (String, i64)>(&sql), filter)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect();

        let sql = format!(
            r#"
            SELECT COALESCE(NULLIF(TRIM(message), ''), '(no message)') AS key, COUNT(*) AS count
            FROM event_logs WHERE 1=1{} AND status = 'failed'
            GROUP BY key ORDER BY count DESC, key ASC LIMIT 5
            "#,
            base
        );
        let top_failed_reasons = bind_filters(sqlx::query_as::<_, (String, i64)>(&sql), filter)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect();

        Ok(EventLogStats {
            total_count,
            failed_count,
            failure_rate,
            p95_duration_ms,
            slow_count,
            source_distribution,
            top_actions,
            top_failed_reasons,
        })
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    async fn maybe_cleanup_event_logs(&self, policy: &LogPolicy) {
        if policy.retention_days <= 0 && policy.max_mb <= 0 {
            return;
        }
        if !self.event_cleanup_due(policy.cleanup_interval_sec) {
            return;
        }
        if let Err(error) = self
            .cleanup_event_logs(policy.retention_days, policy.max_mb * 1_048_576)
            .await
        {
            tracing::warn!(error = %error, "event log cleanup failed");
        }
    }

    /// Delete rows past the time window, then trim the oldest rows in
    /// batches of 500 until the size estimate fits. Returns deleted count.
    pub async fn cleanup_event_logs(&self, retention_days: i64, max_bytes: i64) -> Result<u64> {
        let mut deleted = 0u64;

        if retention_days > 0 {
            let cutoff = Utc::now() - Duration::days(retention_days);
            let result = sqlx::query("DELETE FROM event_logs WHERE created_at < ?")
                .bind(cutoff)
                .execute(self.pool())
                .await?;
            deleted += result.rows_affected();
        }

        if max_bytes > 0 {
            let mut estimated = self.estimate_event_logs_size_bytes().await?;
            while estimated > max_bytes {
                let result = sqlx::query(
                    r#"
                    DELETE FROM event_logs
                    WHERE id IN (SELECT id FROM event_logs ORDER BY id ASC LIMIT 500)
                    "#,
                )
                .execute(self.pool())
                .await?;
                let step = result.rows_affected();
                if step == 0 {
                    break;
                }
                deleted += step;
                estimated = self.estimate_event_logs_size_bytes().await?;
            }
        }

        Ok(deleted)
    }

    /// Approximates on-disk footprint as the sum of text-column lengths plus
    /// a fixed per-row overhead. Not exact; callers needing hard bounds
    /// should measure the file instead.
    pub async fn estimate_event_logs_size_bytes(&self) -> Result<i64> {
        let size: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                LENGTH(COALESCE(created_at, '')) +
                LENGTH(COALESCE(source, '')) +
                LENGTH(COALESCE(action, '')) +
                LENGTH(COALESCE(event, '')) +
                LENGTH(COALESCE(phase, '')) +
                LENGTH(COALESCE(status, '')) +
                LENGTH(COALESCE(level, '')) +
                LENGTH(COALESCE(message, '')) +
                LENGTH(COALESCE(trace_id, '')) +
                LENGTH(COALESCE(request_id, '')) +
                LENGTH(COALESCE(method, '')) +
                LENGTH(COALESCE(path, '')) +
                LENGTH(COALESCE(query_text, '')) +
                LENGTH(COALESCE(CAST(status_code AS TEXT), '')) +
                LENGTH(COALESCE(CAST(duration_ms AS TEXT), '')) +
                LENGTH(COALESCE(CAST(is_slow AS TEXT), '')) +
                LENGTH(COALESCE(operator_username, '')) +
                LENGTH(COALESCE(ip, '')) +
                LENGTH(COALESCE(user_agent, '')) +
                LENGTH(COALESCE(resource_type, '')) +
                LENGTH(COALESCE(resource_id, '')) +
                LENGTH(COALESCE(error_type, '')) +
                LENGTH(COALESCE(error_code, '')) +
                LENGTH(COALESCE(metadata_json, '')) +
                64
            ), 0)
            FROM event_logs
            "#,
        )
        .fetch_one(self.pool())
        .await?;
        Ok(size.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Legacy audit log
    // ------------------------------------------------------------------

    pub async fn create_audit_log(
        &self,
        category: &str,
        action: &str,
        status: &str,
        operator: Option<&str>,
        detail: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let policy = self.log_policy();
        let metadata_json = metadata.map(|value| mask_json(policy.mask_mode, value).to_string());
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_logs (created_at, category, action, status, operator_username, detail, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .bind(category)
        .bind(action)
        .bind(status)
        .bind(operator)
        .bind(detail)
        .bind(metadata_json)
        .fetch_one(self.pool())
        .await?;

        if policy.audit_retention_days > 0 && self.audit_cleanup_due(policy.audit_cleanup_interval_sec)
        {
            let cutoff = Utc::now() - Duration::days(policy.audit_retention_days);
            if let Err(error) = sqlx::query("DELETE FROM audit_logs WHERE created_at < ?")
                .bind(cutoff)
                .execute(self.pool())
                .await
            {
                tracing::warn!(error = %error, "audit log cleanup failed");
            }
        }
        Ok(id)
    }

    pub async fn list_audit_logs(
        &self,
        category: Option<&str>,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<CursorPage<AuditLog>> {
        let safe_limit = limit.clamp(1, 500) as usize;
        let cursor_id = parse_cursor(cursor);
        let mut sql = String::from("SELECT * FROM audit_logs WHERE 1=1");
        if category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if cursor_id.is_some() {
            sql.push_str(" AND id < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, AuditLog>(&sql);
        if let Some(category) = category {
            query = query.bind(category);
        }
        if let Some(id) = cursor_id {
            query = query.bind(id);
        }
        let rows = query
            .bind((safe_limit + 1) as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(CursorPage::from_rows(rows, safe_limit, |row| row.id))
    }
}

/// A failed task event joined back to its job row, for quality scoring.
#[derive(FromRow, Debug, Clone)]
pub struct JobFailEvent {
    pub id: i64,
    pub job_id: i64,
    pub profile_id: i64,
    pub phase: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Failed job events in a group since `since`, newest first. Backed by
    /// the (source, resource_type, event, created_at) index.
    pub async fn list_task_fail_events_since(
        &self,
        group_title: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobFailEvent>> {
        let rows = sqlx::query_as::<_, JobFailEvent>(
            r#"
            SELECT e.id,
                   CAST(e.resource_id AS INTEGER) AS job_id,
                   j.profile_id,
                   e.phase,
                   e.message,
                   e.created_at
            FROM event_logs e
            JOIN sora_jobs j ON j.id = CAST(e.resource_id AS INTEGER)
            WHERE j.group_title = ?
              AND e.source = 'task'
              AND e.resource_type = 'sora_job'
              AND e.event = 'fail'
              AND e.created_at >= ?
            ORDER BY e.id DESC
            "#,
        )
        .bind(group_title)
        .bind(since)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[derive(FromRow, Debug, Clone, Serialize)]
pub struct AuditLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub category: String,
    pub action: String,
    pub status: String,
    pub operator_username: Option<String>,
    pub detail: Option<String>,
    pub metadata_json: Option<String>,
}
