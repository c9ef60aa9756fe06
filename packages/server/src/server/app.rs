//! Application setup and router assembly.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::JwtService;
use crate::kernel::Kernel;
use crate::server::middleware::{jwt_auth_middleware, request_log_middleware};
use crate::server::routes::{auth, health, jobs, logs, settings, stream};

#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub jwt: Arc<JwtService>,
}

/// Build the axum application around an assembled kernel.
pub fn build_app(kernel: Arc<Kernel>, jwt: Arc<JwtService>) -> Router {
    let state = AppState { kernel, jwt };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_origin(Any);

    let api = Router::new()
        .route("/api/v1/auth/login", post(auth::login_handler))
        .route("/api/v1/auth/me", get(auth::me_handler))
        .route(
            "/api/v1/sora/jobs",
            post(jobs::create_job_handler).get(jobs::list_jobs_handler),
        )
        .route("/api/v1/sora/jobs/:id", get(jobs::get_job_handler))
        .route("/api/v1/sora/jobs/:id/cancel", post(jobs::cancel_job_handler))
        .route("/api/v1/sora/scans", post(jobs::trigger_scan_handler))
        .route("/api/v1/admin/logs", get(logs::list_logs_handler))
        .route("/api/v1/admin/logs/stats", get(logs::logs_stats_handler))
        .route("/api/v1/admin/logs/stream", get(stream::logs_stream_handler))
        .route("/api/v1/admin/audit-logs", get(logs::list_audit_logs_handler))
        .route(
            "/api/v1/admin/settings/system",
            get(settings::get_system_settings_handler).put(settings::put_system_settings_handler),
        )
        .route(
            "/api/v1/admin/settings/scheduler/scan",
            get(settings::get_scan_scheduler_handler).put(settings::put_scan_scheduler_handler),
        )
        .route(
            "/api/v1/admin/settings/watermark-free",
            get(settings::get_watermark_handler).put(settings::put_watermark_handler),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_log_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
