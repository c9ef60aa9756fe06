//! Wall-clock scan scheduler: fires a full session scan when the local
//! time in the configured timezone matches one of the configured HH:MM
//! slots.
//!
//! Cross-process idempotence comes from the scheduler_locks table; the
//! in-process fired-slot cache only spares the lock from being hammered by
//! fast ticks within the same minute.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::kernel::scan::ScanService;
use crate::kernel::Kernel;
use crate::store::NewEventLog;

const TICK_INTERVAL: Duration = Duration::from_secs(20);
const LOCK_TTL_SECONDS: i64 = 120;
const FIRED_CACHE_HIGH_WATER: usize = 512;
const FIRED_CACHE_KEEP: usize = 256;

pub struct ScanScheduler {
    kernel: Arc<Kernel>,
    owner: String,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    fired_slots: Mutex<HashSet<String>>,
}

impl ScanScheduler {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            owner: format!("scan-scheduler-{}", &Uuid::new_v4().simple().to_string()[..8]),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            fired_slots: Mutex::new(HashSet::new()),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        *task = Some(tokio::spawn(async move { scheduler.run().await }));
        info!(owner = %self.owner, "scan scheduler started");
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
                error!(error = %error, "scan scheduler tick failed");
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let settings = self.kernel.settings.scan_scheduler();
        if !settings.enabled {
            return Ok(());
        }
        let times = settings.parsed_times();
        if times.is_empty() {
            return Ok(());
        }

        let tz: Tz = settings.timezone.parse().unwrap_or(chrono_tz::UTC);
        let now_local = Utc::now().with_timezone(&tz);
        let hhmm = now_local.format("%H:%M").to_string();
        if !times.contains(&hhmm) {
            return Ok(());
        }

        let slot_key = format!(
            "{} {} {}",
            now_local.format("%Y-%m-%d"),
            hhmm,
            settings.timezone
        );
        {
            let mut fired = self.fired_slots.lock().await;
            if fired.contains(&slot_key) {
                return Ok(());
            }
            // Only trim when the cache grows past its high-water mark.
            if fired.len() > FIRED_CACHE_HIGH_WATER {
                let mut sorted: Vec<String> = fired.drain().collect();
                sorted.sort();
                fired.extend(sorted.into_iter().rev().take(FIRED_CACHE_KEEP));
            }
        }

        let lock_key = format!("scheduler.scan.{}", slot_key);
        if !self
            .kernel
            .store
            .try_acquire_scheduler_lock(&lock_key, &self.owner, LOCK_TTL_SECONDS)
            .await?
        {
            // Another process owns this slot; remember it so later ticks in
            // the same minute do not re-report the conflict.
            self.fired_slots.lock().await.insert(slot_key.clone());
            self.kernel
                .emit(
                    NewEventLog::builder()
                        .source("system")
                        .action("scheduler.scan.lock_conflict")
                        .event(Some("lock_conflict".to_string()))
                        .message(Some(format!("slot {} already claimed", slot_key)))
                        .metadata(Some(serde_json::json!({ "slot_key": slot_key })))
                        .build(),
                )
                .await;
            return Ok(());
        }
        self.fired_slots.lock().await.insert(slot_key.clone());

        let group_title = self.kernel.settings.system().scan.default_group_title;
        let scan = ScanService::new(Arc::clone(&self.kernel));
        match scan.scan_group(&group_title, Some("scan_scheduler")).await {
            Ok(summary) => {
                self.kernel
                    .emit(
                        NewEventLog::builder()
                            .source("system")
                            .action("scheduler.scan.trigger")
                            .event(Some("trigger".to_string()))
                            .message(Some(format!(
                                "scheduled scan fired: group={} slot={}",
                                group_title, slot_key
                            )))
                            .metadata(Some(serde_json::json!({
                                "group_title": group_title,
                                "slot_key": slot_key,
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
                            .action("scheduler.scan.trigger")
                            .event(Some("trigger".to_string()))
                            .status("failed")
                            .level("WARN")
                            .message(Some(format!("scheduled scan failed: {:#}", error)))
                            .metadata(Some(serde_json::json!({
                                "group_title": group_title,
                                "slot_key": slot_key,
                            })))
                            .build(),
                    )
                    .await;
            }
        }
        Ok(())
    }
}
