//! Durable queue and lease protocol behavior.

mod common;

use chrono::{Duration, Utc};
use fleet_core::kernel::jobs::job::{JobStatus, NewJob};

fn queued_job(prompt: &str) -> NewJob {
    NewJob::builder()
        .prompt(prompt)
        .group_title(Some("Sora".to_string()))
        .profile_id(Some(1))
        .build()
}

#[tokio::test]
async fn test_claims_are_fifo_and_exclusive() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job1 = store.create_sora_job(&queued_job("first")).await.unwrap();
    let job2 = store.create_sora_job(&queued_job("second")).await.unwrap();

    let (claim_a, claim_b) = tokio::join!(
        store.claim_next_sora_job("worker-a", 120),
        store.claim_next_sora_job("worker-b", 120),
    );
    let claim_a = claim_a.unwrap().expect("worker-a gets a job");
    let claim_b = claim_b.unwrap().expect("worker-b gets a job");

    // One worker per job, no job lost, lowest id first.
    assert_ne!(claim_a.id, claim_b.id);
    let mut ids = [claim_a.id, claim_b.id];
    ids.sort();
    assert_eq!(ids, [job1.id, job2.id]);

    // Queue drained.
    let none = store.claim_next_sora_job("worker-c", 120).await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_claim_marks_running_and_stamps_lease() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store.create_sora_job(&queued_job("clip")).await.unwrap();
    let claimed = store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.lease_owner.as_deref(), Some("worker-a"));
    assert!(claimed.lease_until.unwrap() > Utc::now());
    assert!(claimed.heartbeat_at.is_some());
    assert!(claimed.started_at.is_some());
    assert_eq!(claimed.run_attempt, 1);
}

#[tokio::test]
async fn test_heartbeat_requires_owner() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store.create_sora_job(&queued_job("clip")).await.unwrap();
    let claimed = store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();

    assert!(store
        .heartbeat_sora_job_lease(claimed.id, "worker-a", 120)
        .await
        .unwrap());
    assert!(!store
        .heartbeat_sora_job_lease(claimed.id, "worker-b", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_lease_recovery_after_crash() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&queued_job("clip")).await.unwrap();
    let claimed = store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);

    // Simulate worker-a crashing: the row stays running, the lease lapses.
    sqlx::query("UPDATE sora_jobs SET lease_until = ? WHERE id = ?")
        .bind(Utc::now() - Duration::seconds(10))
        .bind(job.id)
        .execute(store.pool())
        .await
        .unwrap();

    let recycled = store.requeue_stale_sora_jobs().await.unwrap();
    assert_eq!(recycled, 1);

    let requeued = store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert!(requeued.lease_owner.is_none());
    assert_eq!(requeued.run_last_error.as_deref(), Some("worker lease expired"));

    // Worker-b picks it up; the claim history keeps counting.
    let reclaimed = store
        .claim_next_sora_job("worker-b", 120)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.run_attempt, 2);
    assert_eq!(reclaimed.lease_owner.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn test_live_lease_is_not_requeued() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store.create_sora_job(&queued_job("clip")).await.unwrap();
    store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.requeue_stale_sora_jobs().await.unwrap(), 0);
}

#[tokio::test]
async fn test_clear_lease_is_owner_scoped_and_idempotent() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store.create_sora_job(&queued_job("clip")).await.unwrap();
    let claimed = store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();

    assert!(!store.clear_sora_job_lease(claimed.id, "worker-b").await.unwrap());
    assert!(store.clear_sora_job_lease(claimed.id, "worker-a").await.unwrap());
    assert!(!store.clear_sora_job_lease(claimed.id, "worker-a").await.unwrap());
}

#[tokio::test]
async fn test_terminal_status_drops_lease() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&queued_job("clip")).await.unwrap();
    store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .unwrap();

    store
        .finish_sora_job(job.id, JobStatus::Completed, None)
        .await
        .unwrap();

    let finished = store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.lease_owner.is_none());
    assert!(finished.lease_until.is_none());
    assert!(finished.finished_at.is_some());
}

#[tokio::test]
async fn test_terminal_status_is_sticky() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&queued_job("clip")).await.unwrap();
    store
        .finish_sora_job(job.id, JobStatus::Failed, Some("boom"))
        .await
        .unwrap();

    // Further transitions are no-ops.
    assert!(!store
        .finish_sora_job(job.id, JobStatus::Completed, None)
        .await
        .unwrap());
    assert!(!store.cancel_sora_job(job.id).await.unwrap());

    let row = store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_double_cancel_is_a_noop() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&queued_job("clip")).await.unwrap();

    assert!(store.cancel_sora_job(job.id).await.unwrap());
    assert!(!store.cancel_sora_job(job.id).await.unwrap());
    assert!(store.is_sora_job_canceled(job.id).await.unwrap());

    // Canceled rows are not claimable.
    assert!(store
        .claim_next_sora_job("worker-a", 120)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job = store.create_sora_job(&queued_job("clip")).await.unwrap();
    store.set_job_progress(job.id, 40.0).await.unwrap();
    store.set_job_progress(job.id, 25.0).await.unwrap();

    let row = store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.progress_pct, 40.0);

    store.set_job_progress(job.id, 90.0).await.unwrap();
    let row = store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.progress_pct, 90.0);
}

#[tokio::test]
async fn test_create_then_get_round_trips() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let created = store.create_sora_job(&queued_job("round trip")).await.unwrap();
    let fetched = store.get_sora_job(created.id).await.unwrap().unwrap();

    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.prompt, "round trip");
    assert_eq!(fetched.status, JobStatus::Queued);
    assert_eq!(fetched.duration, created.duration);
    assert_eq!(fetched.aspect_ratio, created.aspect_ratio);

    let listed = store
        .list_sora_jobs(&fleet_core::store::jobs::JobListFilter {
            keyword: Some("round".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);
}

#[tokio::test]
async fn test_pending_submit_reservations() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let job1 = store.create_sora_job(&queued_job("one")).await.unwrap();
    let job2 = store.create_sora_job(&queued_job("two")).await.unwrap();
    store.create_sora_job(&queued_job("three")).await.unwrap();

    // A job that reached the upstream no longer reserves quota.
    store.set_job_task(job1.id, "task_abc").await.unwrap();
    // Terminal jobs never reserve.
    store
        .finish_sora_job(job2.id, JobStatus::Failed, Some("x"))
        .await
        .unwrap();

    let reservations = store.count_pending_submits_by_profile("Sora").await.unwrap();
    assert_eq!(reservations.get(&1).copied().unwrap_or(0), 1);
}
