//! SSE streaming of event-log rows.
//!
//! GET /api/v1/admin/logs/stream?token=JWT&source=task&after_id=123
//!
//! Auth: the JWT rides in the `token` query param because EventSource
//! cannot set headers. Missed rows are replayed from the store before the
//! live broadcast takes over, so a reconnecting client passes the last id
//! it saw and loses nothing.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::kernel::stream_hub::{log_source_topic, TOPIC_LOGS};
use crate::server::app::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
    source: Option<String>,
    after_id: Option<i64>,
}

/// SSE handler: one `log` event per new event-log row.
pub async fn logs_stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let token = query.token.ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state
        .jwt
        .verify_token(&token)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    if !claims.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let topic = match &query.source {
        Some(source) => log_source_topic(source),
        None => TOPIC_LOGS.to_string(),
    };
    // Subscribe before replaying so nothing falls between the two.
    let rx = state.kernel.hub.subscribe(&topic).await;

    let backlog = match query.after_id {
        Some(after_id) => state
            .kernel
            .store
            .list_event_logs_since(after_id, query.source.as_deref(), 500)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        None => Vec::new(),
    };

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let replay = stream::iter(
        backlog
            .into_iter()
            .filter_map(|row| Event::default().event("log").json_data(&row).ok())
            .map(Ok),
    );

    let live = BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(value) => Event::default().event("log").json_data(&value).ok().map(Ok),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(missed)) => {
                Event::default()
                    .event("lagged")
                    .json_data(&serde_json::json!({ "missed": missed }))
                    .ok()
                    .map(Ok)
            }
        }
    });

    Ok(Sse::new(connected.chain(replay).chain(live)).keep_alive(KeepAlive::default()))
}
