//! API request logging into the durable event log.
//!
//! Capture modes: `all` records every request, `failed_slow` only failures
//! and slow requests, `failed_only` only failures. Slowness is judged
//! against `api_slow_threshold_ms`.

use std::time::Instant;

use axum::middleware::Next;
use axum::response::Response;

use crate::server::app::AppState;
use crate::server::middleware::AuthUser;
use crate::store::NewEventLog;

pub async fn request_log_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query_text = request.uri().query().map(str::to_string);
    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let operator = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.username.clone());

    let started = Instant::now();
    let response = next.run(request).await;
    let duration_ms = started.elapsed().as_millis() as i64;
    let status_code = response.status().as_u16() as i64;

    let logging = state.kernel.settings.system().logging;
    let is_failed = status_code >= 400;
    let is_slow = duration_ms >= logging.api_slow_threshold_ms;
    let capture = match logging.api_log_capture_mode.as_str() {
        "failed_only" => is_failed,
        "failed_slow" => is_failed || is_slow,
        _ => true,
    };
    if !capture {
        return response;
    }

    let event = NewEventLog::builder()
        .source("api")
        .action(format!("{} {}", method, path))
        .status(if is_failed { "failed" } else { "success" })
        .level(if is_failed { "WARN" } else { "INFO" }.to_string())
        .method(Some(method))
        .path(Some(path))
        .query_text(query_text)
        .status_code(Some(status_code))
        .duration_ms(Some(duration_ms))
        .is_slow(is_slow)
        .operator_username(operator)
        .user_agent(user_agent)
        .build();
    state.kernel.emit(event).await;

    response
}
