//! Dispatcher filtering, scoring, and reservation behavior.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use fleet_core::kernel::jobs::job::NewJob;
use fleet_core::kernel::jobs::Dispatcher;
use fleet_core::kernel::settings::AccountDispatchSettings;
use fleet_core::store::{NewEventLog, Store};

const GROUP: &str = "Sora";

fn dispatchable_job(store_group: &str) -> NewJob {
    NewJob::builder()
        .prompt("a red panda skateboarding")
        .group_title(Some(store_group.to_string()))
        .build()
}

async fn fail_event(store: &Store, job_id: i64, phase: &str, message: &str) {
    store
        .create_event_log(
            NewEventLog::builder()
                .source("task")
                .action("sora.job.fail")
                .event(Some("fail".to_string()))
                .phase(Some(phase.to_string()))
                .status("failed")
                .level("WARN")
                .message(Some(message.to_string()))
                .resource_type(Some("sora_job".to_string()))
                .resource_id(Some(job_id.to_string()))
                .build(),
        )
        .await
        .unwrap();
}

/// A terminal job pinned to `profile_id`, used to anchor fail events.
async fn failed_job_on_profile(store: &Store, profile_id: i64) -> i64 {
    let job = store
        .create_sora_job(
            &NewJob::builder()
                .prompt("anchor")
                .group_title(Some(GROUP.to_string()))
                .profile_id(Some(profile_id))
                .build(),
        )
        .await
        .unwrap();
    store
        .finish_sora_job(job.id, fleet_core::kernel::jobs::job::JobStatus::Failed, Some("x"))
        .await
        .unwrap();
    job.id
}

#[tokio::test]
async fn test_chooses_profile_with_more_quota() {
    let fixture = common::test_store().await;
    let store = &fixture.store;
    common::seed_scan(
        store,
        GROUP,
        &[
            (1, common::active_snapshot(5, 30)),
            (2, common::active_snapshot(25, 30)),
        ],
    )
    .await;

    let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&job, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap()
        .expect("a candidate");

    assert_eq!(choice.profile_id, 2);
    assert_eq!(choice.mode, "auto");
    assert!(choice.quantity_score > 50.0);
    assert!(choice.reason.contains("score="));
}

#[tokio::test]
async fn test_no_candidates_without_scan() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&job, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap();
    assert!(choice.is_none());
}

#[tokio::test]
async fn test_quota_floor_and_cooldown_filters() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let mut cooling = common::active_snapshot(20, 30);
    cooling.cooldown_until = Some(Utc::now() + Duration::minutes(30));

    common::seed_scan(
        store,
        GROUP,
        &[
            // Below min_quota_remaining (2).
            (1, common::active_snapshot(1, 30)),
            // In active cooldown.
            (2, cooling),
        ],
    )
    .await;

    let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&job, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap();
    assert!(choice.is_none());
}

#[tokio::test]
async fn test_reservations_cap_concurrent_dispatches() {
    // Scenario S5: remaining=3, min_quota_remaining=2 admits at most two
    // dispatches onto the profile.
    let fixture = common::test_store().await;
    let store = &fixture.store;
    common::seed_scan(store, GROUP, &[(1, common::active_snapshot(3, 30))]).await;

    let dispatcher = Dispatcher::new(Arc::clone(store));
    let cfg = AccountDispatchSettings::default();

    let mut chosen = 0;
    let mut rejected = 0;
    for _ in 0..4 {
        let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
        match dispatcher.choose(&job, &cfg, GROUP).await.unwrap() {
            Some(choice) => {
                chosen += 1;
                // Mirror the runner: committing the choice makes this job a
                // pending reservation for the next dispatch.
                store
                    .set_job_dispatch(
                        job.id,
                        choice.profile_id,
                        &choice.mode,
                        choice.score,
                        choice.quantity_score,
                        choice.quality_score,
                        &choice.reason,
                    )
                    .await
                    .unwrap();
            }
            None => rejected += 1,
        }
    }

    assert_eq!(chosen, 2);
    assert_eq!(rejected, 2);
}

#[tokio::test]
async fn test_retry_chain_excludes_tried_profiles() {
    let fixture = common::test_store().await;
    let store = &fixture.store;
    common::seed_scan(
        store,
        GROUP,
        &[
            (1, common::active_snapshot(30, 30)),
            (2, common::active_snapshot(10, 30)),
        ],
    )
    .await;

    // Root job ran (and failed) on the better profile 1.
    let root = store
        .create_sora_job(
            &NewJob::builder()
                .prompt("a red panda skateboarding")
                .group_title(Some(GROUP.to_string()))
                .profile_id(Some(1))
                .build(),
        )
        .await
        .unwrap();
    store
        .finish_sora_job(root.id, fleet_core::kernel::jobs::job::JobStatus::Failed, Some("heavy load"))
        .await
        .unwrap();

    let retry = store
        .create_sora_job(
            &NewJob::builder()
                .prompt("a red panda skateboarding")
                .group_title(Some(GROUP.to_string()))
                .retry_of_job_id(Some(root.id))
                .retry_root_job_id(Some(root.id))
                .retry_index(1)
                .build(),
        )
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&retry, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap()
        .expect("second profile available");
    assert_eq!(choice.profile_id, 2);
    assert_eq!(choice.mode, "retry");
}

#[tokio::test]
async fn test_blocking_error_rule_suppresses_profile() {
    let fixture = common::test_store().await;
    let store = &fixture.store;
    common::seed_scan(store, GROUP, &[(1, common::active_snapshot(30, 30))]).await;

    // Default rules: "heavy load" blocks the profile for 15 minutes.
    let anchor = failed_job_on_profile(store, 1).await;
    fail_event(store, anchor, "submit", "upstream heavy load detected").await;

    let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&job, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap();
    assert!(choice.is_none());
}

#[tokio::test]
async fn test_failures_lower_quality_but_do_not_block() {
    let fixture = common::test_store().await;
    let store = &fixture.store;
    common::seed_scan(
        store,
        GROUP,
        &[
            (1, common::active_snapshot(30, 30)),
            (2, common::active_snapshot(30, 30)),
        ],
    )
    .await;

    // Non-rule failures fall under the default error rule: penalty without
    // a blocking cooldown.
    let anchor = failed_job_on_profile(store, 1).await;
    fail_event(store, anchor, "publish", "publish failed after 5 attempts").await;
    fail_event(store, anchor, "publish", "publish failed after 5 attempts").await;

    let job = store.create_sora_job(&dispatchable_job(GROUP)).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::clone(store));
    let choice = dispatcher
        .choose(&job, &AccountDispatchSettings::default(), GROUP)
        .await
        .unwrap()
        .expect("profile 2 clean");
    assert_eq!(choice.profile_id, 2);
}
