//! Job creation, listing, cancellation, and manual session scans.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::kernel::jobs::job::{AspectRatio, ClipDuration, JobPhase, JobStatus, NewJob};
use crate::kernel::jobs::events as job_events;
use crate::kernel::scan::ScanService;
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::AuthUser;
use crate::store::events::EventLogFilter;
use crate::store::jobs::JobListFilter;
use crate::store::NewEventLog;

#[derive(Deserialize)]
pub struct CreateJobBody {
    pub prompt: String,
    pub profile_id: Option<i64>,
    pub image_url: Option<String>,
    pub duration: Option<String>,
    pub aspect_ratio: Option<String>,
    pub group_title: Option<String>,
}

/// POST /api/v1/sora/jobs
pub async fn create_job_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateJobBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::bad_request("prompt cannot be empty"));
    }

    let sora = state.kernel.settings.system().sora;
    let duration = match body.duration.as_deref() {
        Some(text) => ClipDuration::parse(text)
            .ok_or_else(|| ApiError::bad_request("duration must be one of 10s/15s/25s"))?,
        None => ClipDuration::parse(&sora.default_duration).unwrap_or_default(),
    };
    let aspect_ratio = match body.aspect_ratio.as_deref() {
        Some(text) => AspectRatio::parse(text)
            .ok_or_else(|| ApiError::bad_request("aspect_ratio must be landscape or portrait"))?,
        None => AspectRatio::parse(&sora.default_aspect_ratio).unwrap_or_default(),
    };
    let group_title = body
        .group_title
        .filter(|title| !title.trim().is_empty())
        .unwrap_or(sora.default_group_title);

    let new = NewJob::builder()
        .prompt(prompt)
        .image_url(body.image_url)
        .duration(duration)
        .aspect_ratio(aspect_ratio)
        .group_title(Some(group_title))
        .profile_id(body.profile_id.filter(|id| *id > 0))
        .operator_username(Some(user.username.clone()))
        .build();
    let job = state.kernel.store.create_sora_job(&new).await?;

    state
        .kernel
        .emit(
            NewEventLog::builder()
                .source("task")
                .action("sora.job.create")
                .event(Some("create".to_string()))
                .phase(Some("queue".to_string()))
                .message(Some("job queued".to_string()))
                .operator_username(Some(user.username))
                .resource_type(Some("sora_job".to_string()))
                .resource_id(Some(job.id.to_string()))
                .build(),
        )
        .await;

    Ok(Json(serde_json::to_value(&job).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize, Default)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub phase: Option<String>,
    pub profile_id: Option<i64>,
    pub keyword: Option<String>,
    pub group_title: Option<String>,
    pub limit: Option<i64>,
}

fn parse_status(text: &str) -> Option<JobStatus> {
    serde_json::from_value(json!(text)).ok()
}

fn parse_phase(text: &str) -> Option<JobPhase> {
    serde_json::from_value(json!(text)).ok()
}

/// GET /api/v1/sora/jobs
pub async fn list_jobs_handler(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = JobListFilter {
        status: query
            .status
            .as_deref()
            .map(|text| parse_status(text).ok_or_else(|| ApiError::bad_request("unknown status")))
            .transpose()?,
        phase: query
            .phase
            .as_deref()
            .map(|text| parse_phase(text).ok_or_else(|| ApiError::bad_request("unknown phase")))
            .transpose()?,
        profile_id: query.profile_id,
        group_title: query.group_title,
        keyword: query.keyword,
        limit: query.limit.unwrap_or(100),
    };
    let jobs = state.kernel.store.list_sora_jobs(&filter).await?;
    Ok(Json(json!({ "items": jobs })))
}

/// GET /api/v1/sora/jobs/:id - the job plus its event history.
pub async fn get_job_handler(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(job_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(job) = state.kernel.store.get_sora_job(job_id).await? else {
        return Err(ApiError::NotFound);
    };

    let filter = EventLogFilter {
        source: Some(job_events::SOURCE_TASK.to_string()),
        resource_type: Some(job_events::RESOURCE_SORA_JOB.to_string()),
        resource_id: Some(job_id.to_string()),
        ..Default::default()
    };
    let events = state
        .kernel
        .store
        .list_event_logs(&filter, 200, None)
        .await?;

    Ok(Json(json!({ "job": job, "events": events.items })))
}

/// POST /api/v1/sora/jobs/:id/cancel - idempotent.
pub async fn cancel_job_handler(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(job) = state.kernel.store.get_sora_job(job_id).await? else {
        return Err(ApiError::NotFound);
    };

    let changed = state.kernel.store.cancel_sora_job(job_id).await?;
    if changed {
        state.kernel.emit(job_events::canceled(&job, job.phase)).await;
        state
            .kernel
            .store
            .create_audit_log(
                "sora",
                "job.cancel",
                "success",
                Some(&user.username),
                Some(&format!("job {} canceled", job_id)),
                None,
            )
            .await?;
    }

    let job = state.kernel.store.get_sora_job(job_id).await?;
    Ok(Json(json!({ "job": job, "changed": changed })))
}

#[derive(Deserialize, Default)]
pub struct TriggerScanBody {
    pub group_title: Option<String>,
}

/// POST /api/v1/sora/scans - run a session scan now.
pub async fn trigger_scan_handler(
    State(state): State<AppState>,
    user: AuthUser,
    body: Option<Json<TriggerScanBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let group_title = body
        .and_then(|Json(body)| body.group_title)
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| state.kernel.settings.system().scan.default_group_title);

    let scan = ScanService::new(state.kernel.clone());
    let summary = scan.scan_group(&group_title, Some(&user.username)).await?;
    Ok(Json(serde_json::to_value(&summary).map_err(anyhow::Error::from)?))
}
