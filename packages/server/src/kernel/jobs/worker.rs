//! Worker pool: claims jobs and nurture batches, runs them under a
//! heartbeat companion, and recycles whatever a crashed process left
//! behind.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!     ├─► sora loop: claim up to job_max_concurrency, spawn run_one each
//!     │       run_one: heartbeat task (lease/3) + JobRunner::run
//!     │                finally: clear lease
//!     ├─► nurture loop: one batch at a time, same lease discipline
//!     └─► stale sweeper: requeue expired leases on start + every minute
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::runner::{JobRunner, RunSignals};
use crate::kernel::nurture::NurtureRunner;
use crate::kernel::Kernel;
use crate::store::NewEventLog;

pub const SORA_LEASE_SECONDS: i64 = 120;
pub const NURTURE_LEASE_SECONDS: i64 = 180;
const CLAIM_IDLE_SLEEP: Duration = Duration::from_secs(1);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WorkerPool {
    kernel: Arc<Kernel>,
    owner: String,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running_jobs: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
}

impl WorkerPool {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            owner: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Recover orphaned rows, then start the claim loops. Idempotent:
    /// a second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if !loops.is_empty() {
            return;
        }

        self.recover_on_start().await;

        let pool = Arc::clone(self);
        loops.push(tokio::spawn(async move { pool.sora_loop().await }));
        let pool = Arc::clone(self);
        loops.push(tokio::spawn(async move { pool.nurture_loop().await }));
        let pool = Arc::clone(self);
        loops.push(tokio::spawn(async move { pool.sweep_loop().await }));

        info!(owner = %self.owner, "worker pool started");
    }

    /// Signal shutdown and wait (bounded) for in-flight work to unwind.
    /// Safe to call twice.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let pending = {
                let mut running = self.running_jobs.lock().await;
                running.retain(|_, handle| !handle.is_finished());
                running.len()
            };
            if pending == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "worker pool drain timed out, abandoning tasks");
                let running = self.running_jobs.lock().await;
                for handle in running.values() {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(owner = %self.owner, "worker pool stopped");
    }

    async fn recover_on_start(&self) {
        let sora = self.kernel.store.requeue_stale_sora_jobs().await;
        let nurture = self.kernel.store.requeue_stale_nurture_batches().await;
        match (&sora, &nurture) {
            (Ok(sora_count), Ok(nurture_count)) => {
                self.kernel
                    .emit(
                        NewEventLog::builder()
                            .source("system")
                            .action("worker.start")
                            .event(Some("start".to_string()))
                            .message(Some(format!(
                                "worker started, requeued sora={} nurture={}",
                                sora_count, nurture_count
                            )))
                            .metadata(Some(serde_json::json!({
                                "owner": self.owner,
                                "sora_requeued": sora_count,
                                "nurture_requeued": nurture_count,
                            })))
                            .build(),
                    )
                    .await;
            }
            _ => {
                error!(owner = %self.owner, "startup lease recovery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Sora job loop
    // ------------------------------------------------------------------

    async fn sora_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            {
                let mut running = self.running_jobs.lock().await;
                running.retain(|_, handle| !handle.is_finished());
            }

            let max_concurrency = self
                .kernel
                .settings
                .system()
                .sora
                .job_max_concurrency
                .max(1);

            loop {
                let in_flight = self.running_jobs.lock().await.len();
                if in_flight >= max_concurrency {
                    break;
                }
                match self
                    .kernel
                    .store
                    .claim_next_sora_job(&self.owner, SORA_LEASE_SECONDS)
                    .await
                {
                    Ok(Some(job)) => {
                        debug!(job_id = job.id, owner = %self.owner, "claimed job");
                        let pool = Arc::clone(&self);
                        let handle = tokio::spawn(async move { pool.run_one_job(job.id).await });
                        self.running_jobs.lock().await.insert(job.id, handle);
                    }
                    Ok(None) => break,
                    Err(error) => {
                        error!(error = %error, "failed to claim job");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(CLAIM_IDLE_SLEEP) => {}
            }
        }
    }

    async fn run_one_job(self: Arc<Self>, job_id: i64) {
        let signals = RunSignals::new(self.shutdown.child_token());
        let heartbeat = self.spawn_job_heartbeat(job_id, &signals);

        let runner = JobRunner::new(Arc::clone(&self.kernel), signals.clone());
        let result = runner.run(job_id).await;

        if let Err(error) = &result {
            // Record the failure on the row but do not flip the status:
            // the terminal write belongs to the runner, and an unwound run
            // is recycled by the sweeper.
            if let Err(update_error) = self
                .kernel
                .store
                .set_job_run_last_error(job_id, &format!("{:#}", error))
                .await
            {
                error!(job_id, error = %update_error, "failed to record run error");
            }
            error!(job_id, error = %error, "job run failed");
        }

        heartbeat.abort();
        if let Err(error) = self
            .kernel
            .store
            .clear_sora_job_lease(job_id, &self.owner)
            .await
        {
            error!(job_id, error = %error, "failed to clear job lease");
        }
    }

    fn spawn_job_heartbeat(&self, job_id: i64, signals: &RunSignals) -> JoinHandle<()> {
        let store = Arc::clone(&self.kernel.store);
        let owner = self.owner.clone();
        let lease_lost = Arc::clone(&signals.lease_lost);
        let shutdown = signals.shutdown.clone();
        let interval = Duration::from_secs((SORA_LEASE_SECONDS / 3).max(5) as u64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store
                    .heartbeat_sora_job_lease(job_id, &owner, SORA_LEASE_SECONDS)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        // Somebody else owns the row now; the runner must
                        // stand down without touching it.
                        warn!(job_id, "job lease lost");
                        lease_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(error) => {
                        warn!(job_id, error = %error, "job heartbeat failed");
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Nurture loop (one batch at a time)
    // ------------------------------------------------------------------

    async fn nurture_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let batch = match self
                .kernel
                .store
                .claim_next_nurture_batch(&self.owner, NURTURE_LEASE_SECONDS)
                .await
            {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(CLAIM_IDLE_SLEEP) => {}
                    }
                    continue;
                }
                Err(error) => {
                    error!(error = %error, "failed to claim nurture batch");
                    tokio::time::sleep(CLAIM_IDLE_SLEEP).await;
                    continue;
                }
            };

            let batch_id = batch.id;
            let signals = RunSignals::new(self.shutdown.child_token());
            let heartbeat = self.spawn_nurture_heartbeat(batch_id, &signals);

            let runner = NurtureRunner::new(Arc::clone(&self.kernel), signals);
            if let Err(error) = runner.run(batch_id).await {
                if let Err(update_error) = self
                    .kernel
                    .store
                    .set_nurture_batch_error(batch_id, &format!("{:#}", error))
                    .await
                {
                    error!(batch_id, error = %update_error, "failed to record batch error");
                }
                error!(batch_id, error = %error, "nurture batch failed");
            }

            heartbeat.abort();
            if let Err(error) = self
                .kernel
                .store
                .clear_nurture_batch_lease(batch_id, &self.owner)
                .await
            {
                error!(batch_id, error = %error, "failed to clear batch lease");
            }
        }
    }

    fn spawn_nurture_heartbeat(&self, batch_id: i64, signals: &RunSignals) -> JoinHandle<()> {
        let store = Arc::clone(&self.kernel.store);
        let owner = self.owner.clone();
        let lease_lost = Arc::clone(&signals.lease_lost);
        let shutdown = signals.shutdown.clone();
        let interval = Duration::from_secs((NURTURE_LEASE_SECONDS / 3).max(5) as u64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store
                    .heartbeat_nurture_batch_lease(batch_id, &owner, NURTURE_LEASE_SECONDS)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(batch_id, "nurture batch lease lost");
                        lease_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(error) => {
                        warn!(batch_id, error = %error, "nurture heartbeat failed");
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Stale sweeper
    // ------------------------------------------------------------------

    async fn sweep_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(STALE_SWEEP_INTERVAL) => {}
            }
            if let Err(error) = self.sweep_once().await {
                warn!(error = %error, "stale sweep failed");
            }
        }
    }

    async fn sweep_once(&self) -> Result<()> {
        let sora = self.kernel.store.requeue_stale_sora_jobs().await?;
        let nurture = self.kernel.store.requeue_stale_nurture_batches().await?;
        self.kernel.store.prune_expired_scheduler_locks().await?;
        if sora > 0 || nurture > 0 {
            info!(sora, nurture, "requeued stale leases");
            self.kernel
                .emit(
                    NewEventLog::builder()
                        .source("system")
                        .action("worker.sweep")
                        .event(Some("sweep".to_string()))
                        .message(Some(format!(
                            "requeued stale leases sora={} nurture={}",
                            sora, nurture
                        )))
                        .build(),
                )
                .await;
        }
        Ok(())
    }
}
