//! Admin settings endpoints: system, scan scheduler, watermark-free.

use axum::extract::State;
use axum::Json;

use crate::kernel::settings::{ScanSchedulerSettings, SystemSettings, WatermarkFreeSettings};
use crate::server::app::AppState;
use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::AdminUser;

/// GET /api/v1/admin/settings/system
pub async fn get_system_settings_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let envelope = state.kernel.settings.system_envelope();
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}

/// PUT /api/v1/admin/settings/system
pub async fn put_system_settings_handler(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(settings): Json<SystemSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_system(&settings)?;
    let envelope = state.kernel.settings.update_system(settings).await?;
    state
        .kernel
        .store
        .create_audit_log(
            "settings",
            "settings.system.update",
            "success",
            Some(&admin.0.username),
            None,
            None,
        )
        .await?;
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}

fn validate_system(settings: &SystemSettings) -> Result<(), ApiError> {
    let dispatch = &settings.sora.account_dispatch;
    if !(0.0..=1.0).contains(&dispatch.quantity_weight)
        || !(0.0..=1.0).contains(&dispatch.quality_weight)
    {
        return Err(ApiError::bad_request("dispatch weights must be within [0, 1]"));
    }
    if settings.sora.job_max_concurrency == 0 || settings.sora.job_max_concurrency > 10 {
        return Err(ApiError::bad_request("job_max_concurrency must be within 1..=10"));
    }
    if !matches!(
        settings.logging.api_log_capture_mode.as_str(),
        "all" | "failed_slow" | "failed_only"
    ) {
        return Err(ApiError::bad_request(
            "api_log_capture_mode must be all/failed_slow/failed_only",
        ));
    }
    if !matches!(settings.logging.log_mask_mode.as_str(), "off" | "basic") {
        return Err(ApiError::bad_request("log_mask_mode must be off/basic"));
    }
    Ok(())
}

/// GET /api/v1/admin/settings/scheduler/scan
pub async fn get_scan_scheduler_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let envelope = state.kernel.settings.scan_scheduler_envelope();
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}

/// PUT /api/v1/admin/settings/scheduler/scan
pub async fn put_scan_scheduler_handler(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(settings): Json<ScanSchedulerSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    let envelope = state
        .kernel
        .settings
        .update_scan_scheduler(settings)
        .await
        .map_err(|error| ApiError::bad_request(format!("{:#}", error)))?;
    state
        .kernel
        .store
        .create_audit_log(
            "settings",
            "settings.scan_scheduler.update",
            "success",
            Some(&admin.0.username),
            None,
            None,
        )
        .await?;
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}

/// GET /api/v1/admin/settings/watermark-free
pub async fn get_watermark_handler(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let envelope = state.kernel.settings.watermark_envelope();
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}

/// PUT /api/v1/admin/settings/watermark-free
pub async fn put_watermark_handler(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(settings): Json<WatermarkFreeSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    let envelope = state
        .kernel
        .settings
        .update_watermark(settings)
        .await
        .map_err(|error| ApiError::bad_request(format!("{:#}", error)))?;
    state
        .kernel
        .store
        .create_audit_log(
            "settings",
            "settings.watermark_free.update",
            "success",
            Some(&admin.0.username),
            None,
            None,
        )
        .await?;
    Ok(Json(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?))
}
