//! Event log: masking, pagination, stats, and retention.

mod common;

use chrono::{Duration, Utc};
use fleet_core::store::events::EventLogFilter;
use fleet_core::store::{NewEventLog, Store};

async fn emit(store: &Store, action: &str, status: &str, message: &str) -> i64 {
    store
        .create_event_log(
            NewEventLog::builder()
                .source("system")
                .action(action.to_string())
                .status(status.to_string())
                .level(if status == "failed" { "WARN" } else { "INFO" }.to_string())
                .message(Some(message.to_string()))
                .build(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_metadata_and_message_masking() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let id = store
        .create_event_log(
            NewEventLog::builder()
                .source("api")
                .action("POST /api/v1/auth/login")
                .message(Some("issued Bearer abc.def.ghi to operator".to_string()))
                .metadata(Some(serde_json::json!({
                    "access_token": "secret-token-value",
                    "username": "admin",
                })))
                .build(),
        )
        .await
        .unwrap();

    let rows = store.list_event_logs_since(id - 1, None, 10).await.unwrap();
    let row = rows.iter().find(|row| row.id == id).unwrap();
    assert_eq!(row.message.as_deref(), Some("issued Bearer *** to operator"));
    let metadata: serde_json::Value =
        serde_json::from_str(row.metadata_json.as_deref().unwrap()).unwrap();
    assert_eq!(metadata["access_token"], "***");
    assert_eq!(metadata["username"], "admin");
}

#[tokio::test]
async fn test_cursor_pagination_walks_descending() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    for index in 0..5 {
        emit(store, &format!("test.action.{}", index), "success", "m").await;
    }

    let filter = EventLogFilter::default();
    let first = store.list_event_logs(&filter, 2, None).await.unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.has_more);
    let cursor = first.next_cursor.clone().unwrap();

    let second = store
        .list_event_logs(&filter, 2, Some(&cursor))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 2);

    // Strictly descending ids across pages, no overlap.
    let mut seen: Vec<i64> = first
        .items
        .iter()
        .chain(second.items.iter())
        .map(|row| row.id)
        .collect();
    let mut sorted = seen.clone();
    sorted.sort_by(|a, b| b.cmp(a));
    assert_eq!(seen, sorted);
    seen.dedup();
    assert_eq!(seen.len(), 4);

    let third = store
        .list_event_logs(&filter, 2, second.next_cursor.as_deref())
        .await
        .unwrap();
    assert_eq!(third.items.len(), 1);
    assert!(!third.has_more);
    assert!(third.next_cursor.is_none());
}

#[tokio::test]
async fn test_filters_by_source_status_and_keyword() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    emit(store, "scheduler.scan.trigger", "success", "scan fired").await;
    emit(store, "scheduler.scan.trigger", "failed", "scan blew up").await;

    let failed = store
        .list_event_logs(
            &EventLogFilter {
                status: Some("failed".to_string()),
                ..Default::default()
            },
            10,
            None,
        )
        .await
        .unwrap();
    assert_eq!(failed.items.len(), 1);
    assert_eq!(failed.items[0].message.as_deref(), Some("scan blew up"));

    let keyword = store
        .list_event_logs(
            &EventLogFilter {
                keyword: Some("blew".to_string()),
                ..Default::default()
            },
            10,
            None,
        )
        .await
        .unwrap();
    assert_eq!(keyword.items.len(), 1);

    let none = store
        .list_event_logs(
            &EventLogFilter {
                source: Some("api".to_string()),
                ..Default::default()
            },
            10,
            None,
        )
        .await
        .unwrap();
    assert!(none.items.is_empty());
}

#[tokio::test]
async fn test_stats_aggregate_counts_and_failure_rate() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    emit(store, "a", "success", "fine").await;
    emit(store, "a", "success", "fine").await;
    emit(store, "a", "failed", "broken").await;
    emit(store, "b", "failed", "broken").await;

    let stats = store
        .stats_event_logs(&EventLogFilter::default())
        .await
        .unwrap();
    assert_eq!(stats.total_count, 4);
    assert_eq!(stats.failed_count, 2);
    assert!((stats.failure_rate - 50.0).abs() < f64::EPSILON);
    assert_eq!(stats.top_actions[0].key, "a");
    assert_eq!(stats.top_actions[0].count, 3);
    assert_eq!(stats.top_failed_reasons[0].key, "broken");
    assert_eq!(stats.top_failed_reasons[0].count, 2);
    assert_eq!(stats.p95_duration_ms, None);
}

#[tokio::test]
async fn test_time_retention_deletes_old_rows() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let old_id = emit(store, "old", "success", "ancient").await;
    emit(store, "new", "success", "recent").await;

    sqlx::query("UPDATE event_logs SET created_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::days(45))
        .bind(old_id)
        .execute(store.pool())
        .await
        .unwrap();

    let deleted = store.cleanup_event_logs(30, 0).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining = store
        .list_event_logs(&EventLogFilter::default(), 10, None)
        .await
        .unwrap();
    assert_eq!(remaining.items.len(), 1);
    assert_eq!(remaining.items[0].action, "new");
}

#[tokio::test]
async fn test_size_retention_trims_oldest_until_under_budget() {
    // Scenario S6: 80 rows of ~40 KB against a 1 MB budget.
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let blob = "x".repeat(40 * 1024);
    for _ in 0..80 {
        emit(store, "bulk.insert", "success", &blob).await;
    }

    let before = store.estimate_event_logs_size_bytes().await.unwrap();
    assert!(before > 1_048_576);
    let count_before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_logs")
        .fetch_one(store.pool())
        .await
        .unwrap();

    let deleted = store.cleanup_event_logs(3650, 1_048_576).await.unwrap();
    assert!(deleted > 0);

    let after = store.estimate_event_logs_size_bytes().await.unwrap();
    assert!(after <= 1_048_576);
    let count_after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_logs")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert!(count_after < count_before);

    // Survivors are the newest rows.
    let newest = store
        .list_event_logs(&EventLogFilter::default(), 1, None)
        .await
        .unwrap();
    assert!(!newest.items.is_empty());
}

#[tokio::test]
async fn test_list_since_serves_the_stream() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let first = emit(store, "one", "success", "m").await;
    let second = emit(store, "two", "success", "m").await;
    let third = emit(store, "three", "success", "m").await;

    let since = store.list_event_logs_since(first, None, 100).await.unwrap();
    let ids: Vec<i64> = since.iter().map(|row| row.id).collect();
    assert_eq!(ids, vec![second, third]);

    assert_eq!(store.latest_event_log_id().await.unwrap(), third);
}

#[tokio::test]
async fn test_audit_log_round_trip() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store
        .create_audit_log("settings", "settings.system.update", "success", Some("admin"), None, None)
        .await
        .unwrap();
    store
        .create_audit_log("sora", "job.cancel", "success", Some("admin"), Some("job 1"), None)
        .await
        .unwrap();

    let page = store.list_audit_logs(Some("sora"), 10, None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].action, "job.cancel");
    assert_eq!(page.items[0].detail.as_deref(), Some("job 1"));
}
