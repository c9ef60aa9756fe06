//! Admin log endpoints: filtered listing, aggregate stats, and the legacy
//! audit list.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::server::app::AppState;
use crate::server::error::ApiResult;
use crate::server::middleware::AdminUser;
use crate::store::events::EventLogFilter;

#[derive(Deserialize, Default)]
pub struct LogsQuery {
    pub source: Option<String>,
    pub status: Option<String>,
    pub level: Option<String>,
    pub keyword: Option<String>,
    pub action: Option<String>,
    pub path: Option<String>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub operator: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub slow_only: bool,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

impl LogsQuery {
    fn filter(&self) -> EventLogFilter {
        EventLogFilter {
            source: self.source.clone(),
            status: self.status.clone(),
            level: self.level.clone(),
            operator: self.operator.clone(),
            keyword: self.keyword.clone(),
            action: self.action.clone(),
            path: self.path.clone(),
            trace_id: self.trace_id.clone(),
            request_id: self.request_id.clone(),
            start_at: self.start_at,
            end_at: self.end_at,
            slow_only: self.slow_only,
            resource_type: self.resource_type.clone(),
            resource_id: self.resource_id.clone(),
        }
    }
}

/// GET /api/v1/admin/logs
pub async fn list_logs_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = state
        .kernel
        .store
        .list_event_logs(
            &query.filter(),
            query.limit.unwrap_or(200),
            query.cursor.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "items": page.items,
        "has_more": page.has_more,
        "next_cursor": page.next_cursor,
    })))
}

/// GET /api/v1/admin/logs/stats
pub async fn logs_stats_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.kernel.store.stats_event_logs(&query.filter()).await?;
    Ok(Json(serde_json::to_value(&stats).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize, Default)]
pub struct AuditQuery {
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

/// GET /api/v1/admin/audit-logs (legacy view)
pub async fn list_audit_logs_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = state
        .kernel
        .store
        .list_audit_logs(
            query.category.as_deref(),
            query.limit.unwrap_or(200),
            query.cursor.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "items": page.items,
        "has_more": page.has_more,
        "next_cursor": page.next_cursor,
    })))
}
