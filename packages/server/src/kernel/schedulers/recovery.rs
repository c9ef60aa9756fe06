//! Account-recovery scheduler: periodic session scans driven by the
//! dispatch configuration, so cooled-down or refreshed accounts come back
//! into rotation without operator action.
//!
//! Interval slots are floor-divided wall-clock buckets; the bucket index
//! keys the cross-process lock. When disabled, the scheduler parks and
//! logs the pause reason exactly once per state change.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::kernel::scan::ScanService;
use crate::kernel::Kernel;
use crate::store::NewEventLog;

const TICK_INTERVAL: Duration = Duration::from_secs(10);
const LOCK_TTL_SECONDS: i64 = 120;

pub struct RecoveryScheduler {
    kernel: Arc<Kernel>,
    owner: String,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    pause_reason: Mutex<Option<String>>,
    next_run_at: Mutex<i64>,
    last_conflict_slot: Mutex<i64>,
}

impl RecoveryScheduler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            owner: format!(
                "account-recovery-{}",
                &Uuid::new_v4().simple().to_string()[..8]
            ),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            pause_reason: Mutex::new(None),
            next_run_at: Mutex::new(0),
            last_conflict_slot: Mutex::new(-1),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        {
            // First run lands one full interval after start.
            let cfg = self.kernel.settings.system().sora.account_dispatch;
            let interval = cfg.auto_scan_interval_minutes.max(1) * 60;
            *self.next_run_at.lock().await = Utc::now().timestamp() + interval;
        }
        let scheduler = Arc::clone(self);
        *task = Some(tokio::spawn(async move { scheduler.run().await }));
        info!(owner = %self.owner, "recovery scheduler started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
            if let Err(error) = self.tick().await {
                error!(error = %error, "recovery scheduler tick failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let cfg = self.kernel.settings.system().sora.account_dispatch;
        if !cfg.enabled {
            self.set_paused("disabled").await;
            return Ok(());
        }
        if !cfg.auto_scan_enabled {
            self.set_paused("auto_scan_disabled").await;
            return Ok(());
        }
        *self.pause_reason.lock().await = None;

        let now = Utc::now().timestamp();
        {
            let next = *self.next_run_at.lock().await;
            if now < next {
                return Ok(());
            }
        }

        let interval_minutes = cfg.auto_scan_interval_minutes.max(1);
        let interval_secs = interval_minutes * 60;
        let slot = now / interval_secs;
        let lock_key = format!("scheduler.account_recovery.{}", slot);

        if !self
            .kernel
            .store
            .try_acquire_scheduler_lock(&lock_key, &self.owner, LOCK_TTL_SECONDS)
            .await?
        {
            // Another process took this slot; probe again shortly in case
            // the winner dies before its lock TTL runs out. Report the
            // conflict once per slot.
            *self.next_run_at.lock().await = now + 5;
            let mut last_conflict = self.last_conflict_slot.lock().await;
            if *last_conflict != slot {
                *last_conflict = slot;
                self.kernel
                    .emit(
                        NewEventLog::builder()
                            .source("system")
                            .action("scheduler.account_recovery.lock_conflict")
                            .event(Some("lock_conflict".to_string()))
                            .message(Some(format!("slot {} already claimed", slot)))
                            .metadata(Some(serde_json::json!({ "slot": slot })))
                            .build(),
                    )
                    .await;
            }
            return Ok(());
        }

        let group_title = if cfg.auto_scan_group_title.trim().is_empty() {
            "Sora".to_string()
        } else {
            cfg.auto_scan_group_title.trim().to_string()
        };
        *self.next_run_at.lock().await = now + interval_secs;

        let scan = ScanService::new(Arc::clone(&self.kernel));
        match scan
            .scan_group(&group_title, Some("account_recovery_scheduler"))
            .await
        {
            Ok(summary) => {
                self.kernel
                    .emit(
                        NewEventLog::builder()
                            .source("system")
                            .action("scheduler.account_recovery.trigger")
                            .event(Some("trigger".to_string()))
                            .message(Some(format!("account recovery scan: group={}", group_title)))
                            .metadata(Some(serde_json::json!({
                                "group_title": group_title,
                                "interval_minutes": interval_minutes,
                                "run_id": summary.run_id,
                            })))
                            .build(),
                    )
                    .await;
            }
            Err(error) => {
                self.kernel
                    .emit(
                        NewEventLog::builder()
                            .source("system")
                            .action("scheduler.account_recovery.trigger")
                            .event(Some("trigger".to_string()))
                            .status("failed")
                            .level("WARN")
                            .message(Some(format!("account recovery scan failed: {:#}", error)))
                            .metadata(Some(serde_json::json!({
                                "group_title": group_title,
                                "interval_minutes": interval_minutes,
                            })))
                            .build(),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Log the pause once per distinct reason.
    async fn set_paused(&self, reason: &str) {
        let mut current = self.pause_reason.lock().await;
        if current.as_deref() == Some(reason) {
            return;
        }
        *current = Some(reason.to_string());

        let message = match reason {
            "disabled" => "account recovery paused: account_dispatch.enabled=false",
            "auto_scan_disabled" => "account recovery paused: auto_scan_enabled=false",
            _ => "account recovery paused",
        };
        self.kernel
            .emit(
                NewEventLog::builder()
                    .source("system")
                    .action("scheduler.account_recovery.paused")
                    .event(Some("paused".to_string()))
                    .message(Some(message.to_string()))
                    .metadata(Some(serde_json::json!({
                        "reason": reason,
                        "owner": self.owner,
                    })))
                    .build(),
            )
            .await;
    }
}
