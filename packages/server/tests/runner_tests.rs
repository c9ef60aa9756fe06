//! Job state machine: happy path, transport failover, overload retries,
//! duplicate publish, watermark failures, and cooperative cancellation.

mod common;

use std::sync::Arc;

use fleet_core::kernel::jobs::job::{JobStatus, NewJob, WatermarkStatus};
use fleet_core::kernel::jobs::{JobRunner, RunSignals};
use fleet_core::kernel::upstream::testing::{
    challenged_poll, completed_poll, heavy_load_submit, ok_publish, progressing_poll,
    VALID_PUBLISH_URL,
};
use fleet_core::kernel::upstream::{PollReply, PublishReply};
use fleet_core::store::events::EventLogFilter;
use fleet_core::store::Store;
use tokio_util::sync::CancellationToken;

const GROUP: &str = "Sora";

async fn enqueue_pinned(store: &Store, profile_id: i64) -> i64 {
    let job = store
        .create_sora_job(
            &NewJob::builder()
                .prompt("a lighthouse in a storm")
                .group_title(Some(GROUP.to_string()))
                .profile_id(Some(profile_id))
                .build(),
        )
        .await
        .unwrap();
    job.id
}

/// Claim the next job and run it to completion, the way the worker does.
async fn claim_and_run(kernel: &Arc<fleet_core::kernel::Kernel>, owner: &str) -> i64 {
    let claimed = kernel
        .store
        .claim_next_sora_job(owner, 120)
        .await
        .unwrap()
        .expect("a claimable job");
    let runner = JobRunner::new(
        Arc::clone(kernel),
        RunSignals::new(CancellationToken::new()),
    );
    runner.run(claimed.id).await.unwrap();
    kernel
        .store
        .clear_sora_job_lease(claimed.id, owner)
        .await
        .unwrap();
    claimed.id
}

async fn job_events(store: &Store, job_id: i64) -> Vec<(String, String)> {
    let filter = EventLogFilter {
        source: Some("task".to_string()),
        resource_type: Some("sora_job".to_string()),
        resource_id: Some(job_id.to_string()),
        ..Default::default()
    };
    let page = store.list_event_logs(&filter, 100, None).await.unwrap();
    // Oldest first.
    page.items
        .into_iter()
        .rev()
        .map(|row| {
            (
                row.phase.unwrap_or_default(),
                row.event.unwrap_or_default(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_happy_path_completes_with_publish_url() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.publish_url.as_deref(), Some(VALID_PUBLISH_URL));
    assert!(job.task_id.is_some());
    assert!(job.generation_id.is_some());
    assert_eq!(job.watermark_status, Some(WatermarkStatus::Completed));
    assert!(job.watermark_url.is_some());
    assert!(job.lease_owner.is_none());

    // Events walk the state machine in order: each phase opens with a
    // start and closes with a finish, ending at done.
    let events = job_events(&kernel.store, job_id).await;
    let expected = [
        ("submit", "start"),
        ("submit", "finish"),
        ("progress", "start"),
        ("progress", "finish"),
        ("publish", "start"),
        ("publish", "finish"),
        ("watermark", "start"),
        ("watermark", "finish"),
        ("done", "finish"),
    ];
    let flattened: Vec<(&str, &str)> = events
        .iter()
        .map(|(phase, event)| (phase.as_str(), event.as_str()))
        .collect();
    assert_eq!(flattened, expected);
}

#[tokio::test]
async fn test_transport_failover_recovers_then_completes() {
    // Scenario S3: proxied poll hits a challenge, the in-browser transport
    // finishes the job.
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    fixture.script.push_api_poll(challenged_poll());
    fixture.script.push_browser_poll(progressing_poll(40.0));
    fixture.script.push_browser_poll(completed_poll("gen_ok"));

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.generation_id.as_deref(), Some("gen_ok"));

    let events = job_events(&kernel.store, job_id).await;
    assert!(events
        .iter()
        .any(|(phase, event)| phase == "progress" && event == "transport_failover"));
}

#[tokio::test]
async fn test_second_challenge_fails_the_phase() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    fixture.script.push_api_poll(challenged_poll());
    fixture.script.push_browser_poll(challenged_poll());

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("challenge"));
}

#[tokio::test]
async fn test_heavy_load_spawns_retry_row() {
    // Scenario S4: overload does not retry on the same profile; it chains
    // a fresh job for the dispatcher.
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    fixture.script.push_submit(heavy_load_submit());

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let original = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Failed);
    assert!(original.error.as_deref().unwrap().contains("heavy load"));

    let retry = kernel
        .store
        .get_sora_job(job_id + 1)
        .await
        .unwrap()
        .expect("retry row created");
    assert_eq!(retry.retry_of_job_id, Some(job_id));
    assert_eq!(retry.retry_root_job_id, Some(job_id));
    assert_eq!(retry.retry_index, 1);
    assert_eq!(retry.status, JobStatus::Queued);
    // The retry is unpinned: the dispatcher re-selects, excluding the
    // profiles the chain already burned.
    assert_eq!(retry.profile_id, 0);
}

#[tokio::test]
async fn test_heavy_load_retries_are_bounded() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let mut system = kernel.settings.system();
    system.sora.heavy_load_retry_max_attempts = 1;
    kernel.settings.update_system(system).await.unwrap();

    // First job overloads -> one retry allowed.
    fixture.script.push_submit(heavy_load_submit());
    let first_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;
    let retry = kernel.store.get_sora_job(first_id + 1).await.unwrap().unwrap();
    assert_eq!(retry.retry_index, 1);

    // The retry overloads too; the budget (1) is spent, so no third row.
    kernel
        .store
        .set_job_dispatch(retry.id, 1, "retry", 0.0, 0.0, 0.0, "pinned for test")
        .await
        .unwrap();
    fixture.script.push_submit(heavy_load_submit());
    claim_and_run(kernel, "worker-a").await;

    let retry = kernel.store.get_sora_job(retry.id).await.unwrap().unwrap();
    assert_eq!(retry.status, JobStatus::Failed);
    assert!(retry.error.as_deref().unwrap().contains("retries exhausted"));
    assert!(kernel.store.get_sora_job(retry.id + 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_publish_resolves_existing_url() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    fixture.script.push_api_publish(PublishReply {
        error_code: Some("duplicate".to_string()),
        ..Default::default()
    });
    // The draft poll that resolves the already-published URL.
    fixture.script.push_api_poll(completed_poll("gen_first"));
    fixture.script.push_api_poll(PollReply {
        state: "completed".to_string(),
        draft_publish_url: Some(VALID_PUBLISH_URL.to_string()),
        ..Default::default()
    });

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.publish_url.as_deref(), Some(VALID_PUBLISH_URL));
}

#[tokio::test]
async fn test_invalid_publish_url_fails_job() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    // Slug has no digit, so validation rejects it.
    fixture
        .script
        .push_api_publish(ok_publish("https://sora.chatgpt.com/p/s_abcdefgh"));

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("invalid url"));
}

#[tokio::test]
async fn test_watermark_failure_never_fails_the_job() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    // Exhaust every rewrite attempt (retry_max=2 -> 3 calls).
    for _ in 0..3 {
        fixture
            .watermark
            .push(Err(anyhow::anyhow!("parse service unavailable")));
    }

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.publish_url.as_deref(), Some(VALID_PUBLISH_URL));
    // fallback_on_failure=true downgrades the failure to skipped.
    assert_eq!(job.watermark_status, Some(WatermarkStatus::Skipped));
    assert!(job.watermark_error.is_some());
}

#[tokio::test]
async fn test_watermark_disabled_is_skipped_quietly() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let mut watermark = kernel.settings.watermark();
    watermark.enabled = false;
    kernel.settings.update_watermark(watermark).await.unwrap();

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.watermark_status, Some(WatermarkStatus::Skipped));
    assert!(job.watermark_error.is_none());
}

#[tokio::test]
async fn test_cancellation_is_observed_at_poll_points() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    // Keep the job in progress long enough to cancel it.
    for _ in 0..30 {
        fixture.script.push_api_poll(progressing_poll(10.0));
    }

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    let claimed = kernel
        .store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job_id);

    let runner = JobRunner::new(
        Arc::clone(kernel),
        RunSignals::new(CancellationToken::new()),
    );
    let store = Arc::clone(&kernel.store);
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        store.cancel_sora_job(job_id).await.unwrap();
    });

    runner.run(job_id).await.unwrap();
    cancel.await.unwrap();

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Canceled);

    let events = job_events(&kernel.store, job_id).await;
    assert!(events.iter().any(|(_, event)| event == "cancel"));
}

#[tokio::test]
async fn test_noisy_proxy_prearms_in_browser_transport() {
    // A proxy whose recent polls mostly hit challenges never gets a chance
    // to waste this job's time: the runner starts on in-browser fetch.
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let proxy_id = kernel
        .store
        .upsert_proxy(1, "http", "10.0.0.9", 8080, None, None)
        .await
        .unwrap();
    for _ in 0..4 {
        kernel
            .store
            .record_proxy_cf_event(Some(proxy_id), 1, 0, "progress", true, None)
            .await
            .unwrap();
    }
    let ratio = kernel.store.cf_recent_ratio(proxy_id, 30).await.unwrap();
    assert_eq!(ratio, 1.0);

    // Only the browser path is scripted; an (unexpected) API poll would
    // complete with a default generation id, so mark the browser reply.
    fixture.script.push_browser_poll(completed_poll("gen_browser"));
    fixture.script.push_browser_publish(ok_publish(VALID_PUBLISH_URL));

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.generation_id.as_deref(), Some("gen_browser"));

    let events = job_events(&kernel.store, job_id).await;
    assert!(events
        .iter()
        .any(|(phase, event)| phase == "progress" && event == "transport_failover"));
}

#[tokio::test]
async fn test_live_quota_observation_refreshes_scan_state() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;
    common::seed_scan(&kernel.store, GROUP, &[(1, common::active_snapshot(10, 30))]).await;

    let mut reply = completed_poll("gen_ok");
    reply.remaining_count = Some(4);
    reply.total_count = Some(30);
    fixture.script.push_api_poll(reply);

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let states = kernel.store.latest_profile_states(GROUP).await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].remaining_count, Some(4));
}

#[tokio::test]
async fn test_dispatch_failure_terminates_job() {
    // No scan data at all: the dispatcher has no candidates.
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let job = kernel
        .store
        .create_sora_job(
            &NewJob::builder()
                .prompt("a lighthouse in a storm")
                .group_title(Some(GROUP.to_string()))
                .build(),
        )
        .await
        .unwrap();
    claim_and_run(kernel, "worker-a").await;

    let job = kernel.store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("dispatch.no_candidate"));
}

#[tokio::test]
async fn test_final_event_reconstructs_final_status() {
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let job_id = enqueue_pinned(&kernel.store, 1).await;
    claim_and_run(kernel, "worker-a").await;

    // Replaying the stream: the last event decides the terminal status.
    let events = job_events(&kernel.store, job_id).await;
    let (last_phase, last_event) = events.last().unwrap();
    assert_eq!(last_phase, "done");
    assert_eq!(last_event, "finish");

    let job = kernel.store.get_sora_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}
