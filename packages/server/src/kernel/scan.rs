//! Session scans: sweep a profile group through the browser manager and
//! persist each profile's session/quota snapshot. The newest snapshot per
//! profile is the dispatcher's candidate universe.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::kernel::Kernel;
use crate::store::scans::SessionSnapshot;
use crate::store::NewEventLog;

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: i64,
    pub group_title: String,
    pub total: i64,
    pub ok_count: i64,
    pub fail_count: i64,
}

pub struct ScanService {
    kernel: Arc<Kernel>,
}

impl ScanService {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Scan every profile in `group_title`. Per-profile failures are
    /// recorded on their result rows and never abort the run.
    pub async fn scan_group(&self, group_title: &str, operator: Option<&str>) -> Result<ScanSummary> {
        let run_id = self
            .kernel
            .store
            .create_scan_run(group_title, operator)
            .await?;

        let profiles = match self.kernel.browser.list_profiles(group_title).await {
            Ok(profiles) => profiles,
            Err(error) => {
                let message = format!("failed to list profiles: {:#}", error);
                self.kernel
                    .store
                    .finish_scan_run(run_id, "failed", 0, 0, 0, Some(&message))
                    .await?;
                self.emit_scan_event(run_id, group_title, "failed", &message)
                    .await;
                return Err(error);
            }
        };

        let total = profiles.len() as i64;
        let mut ok_count = 0i64;
        let mut fail_count = 0i64;

        for profile in &profiles {
            let snapshot = match self.kernel.browser.fetch_session(profile.profile_id).await {
                Ok(mut snapshot) => {
                    if snapshot.profile_name.is_none() {
                        snapshot.profile_name = profile.name.clone();
                    }
                    ok_count += 1;
                    snapshot
                }
                Err(error) => {
                    fail_count += 1;
                    warn!(profile_id = profile.profile_id, error = %error, "session fetch failed");
                    SessionSnapshot {
                        profile_name: profile.name.clone(),
                        session_status: "unknown".to_string(),
                        plan_type: "unknown".to_string(),
                        error: Some(format!("{:#}", error)),
                        ..Default::default()
                    }
                }
            };

            let hash = snapshot_hash(&snapshot);
            if let Err(error) = self
                .kernel
                .store
                .insert_scan_result(run_id, group_title, profile.profile_id, &snapshot, Some(&hash))
                .await
            {
                warn!(profile_id = profile.profile_id, error = %error, "failed to persist scan result");
            }
        }

        let status = if total > 0 && ok_count == 0 {
            "failed"
        } else {
            "completed"
        };
        let message = format!("scanned {} profiles, {} failed", total, fail_count);
        self.kernel
            .store
            .finish_scan_run(run_id, status, total, ok_count, fail_count, Some(&message))
            .await?;
        self.emit_scan_event(run_id, group_title, status, &message)
            .await;

        Ok(ScanSummary {
            run_id,
            group_title: group_title.to_string(),
            total,
            ok_count,
            fail_count,
        })
    }

    async fn emit_scan_event(&self, run_id: i64, group_title: &str, status: &str, message: &str) {
        self.kernel
            .emit(
                NewEventLog::builder()
                    .source("ixbrowser")
                    .action("ixbrowser.scan")
                    .event(Some("scan".to_string()))
                    .status(if status == "failed" { "failed" } else { "success" })
                    .level(if status == "failed" { "WARN" } else { "INFO" }.to_string())
                    .message(Some(message.to_string()))
                    .resource_type(Some("ixbrowser_scan_run".to_string()))
                    .resource_id(Some(run_id.to_string()))
                    .metadata(Some(serde_json::json!({ "group_title": group_title })))
                    .build(),
            )
            .await;
    }
}

/// Change-detection hash over the snapshot's observable fields.
fn snapshot_hash(snapshot: &SessionSnapshot) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot.session_status.as_bytes());
    hasher.update(snapshot.plan_type.as_bytes());
    hasher.update(
        snapshot
            .remaining_count
            .map(|n| n.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(
        snapshot
            .total_count
            .map(|n| n.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(
        snapshot
            .reset_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default()
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}
