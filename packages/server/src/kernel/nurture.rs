//! Nurture batches: open each profile in turn and let it browse the feed
//! for a while, so fresh accounts accumulate ordinary-looking activity.
//! Batch claiming/heartbeat/recovery share the job lease discipline; this
//! runner only walks the children of an already-claimed batch.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::kernel::jobs::RunSignals;
use crate::kernel::Kernel;
use crate::store::NewEventLog;

pub struct NurtureRunner {
    kernel: Arc<Kernel>,
    signals: RunSignals,
}

impl NurtureRunner {
    pub fn new(kernel: Arc<Kernel>, signals: RunSignals) -> Self {
        Self { kernel, signals }
    }

    /// Run every pending child of the batch in id order. Children fail
    /// individually; the batch completes with aggregate counts.
    pub async fn run(&self, batch_id: i64) -> Result<()> {
        let Some(batch) = self.kernel.store.get_nurture_batch(batch_id).await? else {
            return Ok(());
        };
        if batch.status != "running" {
            return Ok(());
        }
        let warmup_seconds = batch.warmup_seconds.max(1) as u64;

        let jobs = self.kernel.store.list_nurture_jobs(batch_id).await?;
        let mut ok_count = 0i64;
        let mut fail_count = 0i64;

        for job in &jobs {
            if job.status != "queued" {
                if job.status == "completed" {
                    ok_count += 1;
                } else if job.status == "failed" {
                    fail_count += 1;
                }
                continue;
            }
            if self.signals.shutdown.is_cancelled()
                || self.signals.lease_lost.load(std::sync::atomic::Ordering::SeqCst)
            {
                // Abort between children; the sweeper requeues the batch.
                return Ok(());
            }

            self.kernel
                .store
                .update_nurture_job(job.id, "running", "visit", None)
                .await?;

            match self.warm_profile(job.profile_id, warmup_seconds).await {
                Ok(()) => {
                    ok_count += 1;
                    self.kernel
                        .store
                        .update_nurture_job(job.id, "completed", "done", None)
                        .await?;
                }
                Err(error) => {
                    fail_count += 1;
                    warn!(batch_id, profile_id = job.profile_id, error = %error, "nurture visit failed");
                    self.kernel
                        .store
                        .update_nurture_job(job.id, "failed", "visit", Some(&format!("{:#}", error)))
                        .await?;
                }
            }
        }

        let status = if fail_count > 0 && ok_count == 0 {
            "failed"
        } else {
            "completed"
        };
        self.kernel
            .store
            .finish_nurture_batch(batch_id, status, ok_count, fail_count, None)
            .await?;
        self.kernel
            .emit(
                NewEventLog::builder()
                    .source("task")
                    .action("sora.nurture.finish")
                    .event(Some("finish".to_string()))
                    .status(if status == "failed" { "failed" } else { "success" })
                    .message(Some(format!(
                        "nurture batch finished ok={} fail={}",
                        ok_count, fail_count
                    )))
                    .resource_type(Some("sora_nurture_batch".to_string()))
                    .resource_id(Some(batch_id.to_string()))
                    .build(),
            )
            .await;
        Ok(())
    }

    async fn warm_profile(&self, profile_id: i64, warmup_seconds: u64) -> Result<()> {
        let mut session = self.kernel.browser.open(profile_id).await?;
        let visit = session.visit_feed(warmup_seconds).await;
        let close = session.close().await;
        visit?;
        close?;
        Ok(())
    }
}
