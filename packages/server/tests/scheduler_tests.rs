//! Scheduler locks and worker-pool lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::kernel::jobs::job::{JobStatus, NewJob};
use fleet_core::kernel::jobs::WorkerPool;

#[tokio::test]
async fn test_scheduler_lock_admits_exactly_one_owner() {
    // Scenario S7 at the storage layer: one winner per key per TTL window.
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let key = "scheduler.scan.2026-08-01 09:00 Asia/Shanghai";
    let first = store
        .try_acquire_scheduler_lock(key, "scheduler-a", 120)
        .await
        .unwrap();
    let second = store
        .try_acquire_scheduler_lock(key, "scheduler-b", 120)
        .await
        .unwrap();

    assert!(first);
    assert!(!second);

    // A different slot is an independent lock.
    assert!(store
        .try_acquire_scheduler_lock("scheduler.scan.2026-08-01 13:30 Asia/Shanghai", "scheduler-b", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_scheduler_lock_reopens_after_ttl() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    let key = "scheduler.account_recovery.12345";
    assert!(store
        .try_acquire_scheduler_lock(key, "scheduler-a", 1)
        .await
        .unwrap());
    assert!(!store
        .try_acquire_scheduler_lock(key, "scheduler-b", 1)
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(store
        .try_acquire_scheduler_lock(key, "scheduler-b", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_empty_lock_key_is_rejected() {
    let fixture = common::test_store().await;
    let store = &fixture.store;
    assert!(!store
        .try_acquire_scheduler_lock("  ", "scheduler-a", 120)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_prune_drops_only_expired_locks() {
    let fixture = common::test_store().await;
    let store = &fixture.store;

    store
        .try_acquire_scheduler_lock("live", "scheduler-a", 300)
        .await
        .unwrap();
    store
        .try_acquire_scheduler_lock("stale", "scheduler-a", 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(store.prune_expired_scheduler_locks().await.unwrap(), 1);
    // The live lock still excludes other owners.
    assert!(!store
        .try_acquire_scheduler_lock("live", "scheduler-b", 300)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_worker_pool_recovers_and_runs_orphaned_job() {
    // A crashed process left a running row with an expired lease; a fresh
    // pool requeues it on start and drives it to completion.
    let fixture = common::test_kernel(vec![(1, common::active_snapshot(10, 30))]).await;
    let kernel = &fixture.kernel;

    let job = kernel
        .store
        .create_sora_job(
            &NewJob::builder()
                .prompt("an origami crane unfolding")
                .group_title(Some("Sora".to_string()))
                .profile_id(Some(1))
                .build(),
        )
        .await
        .unwrap();
    // Orphan it: running, lease in the past, stale owner.
    kernel
        .store
        .claim_next_sora_job("dead-worker", 120)
        .await
        .unwrap()
        .unwrap();
    sqlx::query("UPDATE sora_jobs SET status = 'queued', lease_until = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::seconds(30))
        .bind(job.id)
        .execute(kernel.store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE sora_jobs SET status = 'running' WHERE id = ?")
        .bind(job.id)
        .execute(kernel.store.pool())
        .await
        .unwrap();

    let pool = Arc::new(WorkerPool::new(Arc::clone(kernel)));
    pool.start().await;

    // Wait for the pool to claim and finish the job.
    let mut finished = false;
    for _ in 0..100 {
        let row = kernel.store.get_sora_job(job.id).await.unwrap().unwrap();
        if row.status.is_terminal() {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    pool.stop().await;

    assert!(finished, "job was not recovered in time");
    let row = kernel.store.get_sora_job(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert!(row.lease_owner.is_none());
    assert!(row.run_attempt >= 2);
}

#[tokio::test]
async fn test_worker_pool_runs_nurture_batch() {
    let fixture = common::test_kernel(vec![
        (1, common::active_snapshot(10, 30)),
        (2, common::active_snapshot(10, 30)),
    ])
    .await;
    let kernel = &fixture.kernel;

    let batch = kernel
        .store
        .create_nurture_batch(Some("Sora"), Some("warm up fresh accounts"), &[1, 2], 1, Some("admin"))
        .await
        .unwrap();
    assert_eq!(batch.total, 2);

    let pool = Arc::new(WorkerPool::new(Arc::clone(kernel)));
    pool.start().await;

    let mut finished = false;
    for _ in 0..100 {
        let row = kernel.store.get_nurture_batch(batch.id).await.unwrap().unwrap();
        if row.status == "completed" || row.status == "failed" {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    pool.stop().await;

    assert!(finished, "batch did not finish in time");
    let row = kernel.store.get_nurture_batch(batch.id).await.unwrap().unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(row.ok_count, 2);
    assert_eq!(row.fail_count, 0);
    assert!(row.lease_owner.is_none());

    let children = kernel.store.list_nurture_jobs(batch.id).await.unwrap();
    assert!(children.iter().all(|child| child.status == "completed"));
}

#[tokio::test]
async fn test_worker_pool_double_stop_is_a_noop() {
    let fixture = common::test_kernel(vec![]).await;
    let pool = Arc::new(WorkerPool::new(Arc::clone(&fixture.kernel)));

    pool.start().await;
    // A second start while running is ignored.
    pool.start().await;

    pool.stop().await;
    pool.stop().await;
}
