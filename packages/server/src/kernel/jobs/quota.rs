//! Per-profile quota view: persisted scan state plus pending-submit
//! reservations computed at query time. Two concurrent dispatches can
//! therefore never both see "enough quota" for the same last slot.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::kernel::stream_hub::{StreamHub, TOPIC_QUOTA};
use crate::store::scans::{ProfileState, SessionSnapshot};
use crate::store::Store;

/// One profile as the dispatcher sees it: last scan state minus the quota
/// already reserved by queued-but-unsubmitted jobs.
#[derive(Debug, Clone)]
pub struct QuotaView {
    pub state: ProfileState,
    pub reservations: i64,
    pub active_jobs: i64,
}

impl QuotaView {
    /// Remaining quota after reservations; `None` when never observed.
    /// A cooldown that lapsed within the grace window reads as a refreshed
    /// daily quota.
    pub fn effective_remaining(&self, grace_minutes: i64, now: DateTime<Utc>) -> Option<i64> {
        let mut remaining = self.state.remaining_count?;
        if let (Some(cooldown), Some(total)) = (self.state.cooldown_until, self.state.total_count) {
            let grace_edge = cooldown + Duration::minutes(grace_minutes.max(0));
            if cooldown <= now && now <= grace_edge {
                remaining = total;
            }
        }
        Some((remaining - self.reservations).max(0))
    }
}

pub struct QuotaTracker {
    store: Arc<Store>,
}

impl QuotaTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Snapshot every known profile in the group with its reservation and
    /// active-job counts.
    pub async fn profile_views(&self, group_title: &str) -> Result<Vec<QuotaView>> {
        let states = self.store.latest_profile_states(group_title).await?;
        let reservations = self
            .store
            .count_pending_submits_by_profile(group_title)
            .await?;
        let active = self.store.count_active_jobs_by_profile(group_title).await?;

        Ok(states
            .into_iter()
            .map(|state| {
                let profile_id = state.profile_id;
                QuotaView {
                    state,
                    reservations: reservations.get(&profile_id).copied().unwrap_or(0),
                    active_jobs: active.get(&profile_id).copied().unwrap_or(0),
                }
            })
            .collect())
    }

    /// Record a quota value observed live inside a running job's browser:
    /// refresh the latest scan row and push it to SSE subscribers.
    pub async fn record_observation(
        &self,
        hub: &StreamHub,
        group_title: &str,
        profile_id: i64,
        snapshot: &SessionSnapshot,
    ) -> Result<()> {
        self.store
            .upsert_realtime_quota(group_title, profile_id, snapshot)
            .await?;
        hub.publish(
            TOPIC_QUOTA,
            json!({
                "group_title": group_title,
                "profile_id": profile_id,
                "remaining_count": snapshot.remaining_count,
                "total_count": snapshot.total_count,
                "plan_type": snapshot.plan_type,
                "observed_at": Utc::now(),
            }),
        )
        .await;
        Ok(())
    }
}
