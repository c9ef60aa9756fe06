//! Profile selection for a (possibly retried) job.
//!
//! Candidates come from the latest session scan. Hard filters drop profiles
//! that are cooling down, under the quota floor, or already tried in the
//! job's retry chain; the survivors are ranked by a weighted blend of
//! remaining quota and a time-decayed quality score built from recent
//! failure events.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::job::SoraJob;
use super::quota::{QuotaTracker, QuotaView};
use crate::kernel::settings::AccountDispatchSettings;
use crate::store::events::JobFailEvent;
use crate::store::Store;

/// The dispatcher's verdict for one job.
#[derive(Debug, Clone)]
pub struct DispatchChoice {
    pub profile_id: i64,
    pub mode: String,
    pub score: f64,
    pub quantity_score: f64,
    pub quality_score: f64,
    pub reason: String,
}

/// Why a profile survived or fell out of scoring; kept for the audit trail.
#[derive(Debug, Clone)]
struct Scored {
    view: QuotaView,
    quantity: f64,
    quality: f64,
    final_score: f64,
}

pub struct Dispatcher {
    store: Arc<Store>,
    quota: QuotaTracker,
}

impl Dispatcher {
    pub fn new(store: Arc<Store>) -> Self {
        let quota = QuotaTracker::new(Arc::clone(&store));
        Self { store, quota }
    }

    /// Pick a profile for `job`, or `None` when no candidate passes the
    /// filters. Retries exclude every profile already tried in the chain.
    pub async fn choose(
        &self,
        job: &SoraJob,
        cfg: &AccountDispatchSettings,
        group_title: &str,
    ) -> Result<Option<DispatchChoice>> {
        let now = Utc::now();
        let is_retry = job.retry_of_job_id.is_some();

        let mut excluded: Vec<i64> = Vec::new();
        if is_retry {
            excluded = self
                .store
                .list_retry_chain_profile_ids(job.retry_root())
                .await?;
        }

        let views = self.quota.profile_views(group_title).await?;
        if views.is_empty() {
            return Ok(None);
        }

        let since = now - Duration::hours(cfg.lookback_hours.max(1));
        let fail_events = self
            .store
            .list_task_fail_events_since(group_title, since)
            .await?;
        let mut events_by_profile: HashMap<i64, Vec<&JobFailEvent>> = HashMap::new();
        for event in &fail_events {
            events_by_profile
                .entry(event.profile_id)
                .or_default()
                .push(event);
        }

        let mut candidates: Vec<Scored> = Vec::new();
        for view in views {
            let profile_id = view.state.profile_id;
            if excluded.contains(&profile_id) {
                continue;
            }
            if let Some(cooldown) = view.state.cooldown_until {
                if cooldown > now {
                    continue;
                }
            }

            let remaining = view.effective_remaining(cfg.quota_reset_grace_minutes, now);
            if let Some(remaining) = remaining {
                if remaining < cfg.min_quota_remaining {
                    continue;
                }
            }

            let profile_events = events_by_profile.get(&profile_id);
            let (quality, rule_cooldown_until, cooldown_penalty) =
                quality_score(cfg, profile_events.map(|v| v.as_slice()).unwrap_or(&[]), now);
            if let Some(blocked_until) = rule_cooldown_until {
                if blocked_until > now {
                    continue;
                }
            }

            let quantity = quantity_score(cfg, remaining);
            let plus_bonus = match view.state.plan_type.as_str() {
                "plus" | "pro" | "chatgpt_pro" => cfg.plus_bonus,
                _ => 0.0,
            };
            let final_score = cfg.quantity_weight * quantity + cfg.quality_weight * quality
                - cfg.active_job_penalty * view.active_jobs as f64
                - cooldown_penalty
                + plus_bonus;

            candidates.push(Scored {
                view,
                quantity,
                quality,
                final_score,
            });
        }

        // Highest score wins; ties go to the most recently scanned, then
        // the lowest profile id.
        candidates.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.view.state.last_seen_at.cmp(&a.view.state.last_seen_at))
                .then(a.view.state.profile_id.cmp(&b.view.state.profile_id))
        });

        let Some(best) = candidates.first() else {
            return Ok(None);
        };

        let mode = if is_retry { "retry" } else { "auto" };
        let reason = format!(
            "score={:.1} quantity={:.1} quality={:.1} remaining={} reserved={} active={} plan={}",
            best.final_score,
            best.quantity,
            best.quality,
            best.view
                .state
                .remaining_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            best.view.reservations,
            best.view.active_jobs,
            best.view.state.plan_type,
        );

        Ok(Some(DispatchChoice {
            profile_id: best.view.state.profile_id,
            mode: mode.to_string(),
            score: best.final_score,
            quantity_score: best.quantity,
            quality_score: best.quality,
            reason,
        }))
    }
}

/// Normalised remaining-quota score in [0, 100].
fn quantity_score(cfg: &AccountDispatchSettings, remaining: Option<i64>) -> f64 {
    match remaining {
        Some(remaining) => {
            let cap = cfg.quota_cap.max(1) as f64;
            ((remaining as f64 / cap).clamp(0.0, 1.0)) * 100.0
        }
        None => cfg.unknown_quota_score,
    }
}

/// Time-decayed quality score in [0, 100], plus any rule-imposed cooldown
/// (blocking) and the penalty for a lapsed-but-recent non-blocking one.
fn quality_score(
    cfg: &AccountDispatchSettings,
    events: &[&JobFailEvent],
    now: DateTime<Utc>,
) -> (f64, Option<DateTime<Utc>>, f64) {
    let mut score = cfg.default_quality_score;
    let mut blocking_cooldown: Option<DateTime<Utc>> = None;
    let mut cooldown_penalty = 0.0f64;
    let half_life = cfg.decay_half_life_hours.max(1) as f64;

    for event in events {
        let phase = event.phase.as_deref().unwrap_or("");
        let message = event.message.as_deref().unwrap_or("");

        if cfg
            .quality_ignore_rules
            .iter()
            .any(|rule| rule.matches(phase, message))
        {
            continue;
        }

        let rule = cfg
            .quality_error_rules
            .iter()
            .find(|rule| rule.matches(phase, message));
        let (penalty, cooldown_minutes, blocks) = match rule {
            Some(rule) => (rule.penalty, rule.cooldown_minutes, rule.block_during_cooldown),
            None => (
                cfg.default_error_rule.penalty,
                cfg.default_error_rule.cooldown_minutes,
                cfg.default_error_rule.block_during_cooldown,
            ),
        };

        let age_hours = (now - event.created_at).num_seconds().max(0) as f64 / 3600.0;
        score -= penalty * (2f64).powf(-age_hours / half_life);

        if cooldown_minutes > 0 {
            let until = event.created_at + Duration::minutes(cooldown_minutes);
            if until > now {
                if blocks {
                    blocking_cooldown = Some(
                        blocking_cooldown
                            .map(|current| current.max(until))
                            .unwrap_or(until),
                    );
                } else {
                    cooldown_penalty = cooldown_penalty.max(penalty);
                }
            }
        }
    }

    (score.clamp(0.0, 100.0), blocking_cooldown, cooldown_penalty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(age_hours: i64, phase: &str, message: &str) -> JobFailEvent {
        JobFailEvent {
            id: 1,
            job_id: 1,
            profile_id: 1,
            phase: Some(phase.to_string()),
            message: Some(message.to_string()),
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn test_quantity_score_normalisation() {
        let cfg = AccountDispatchSettings::default();
        assert_eq!(quantity_score(&cfg, Some(30)), 100.0);
        assert_eq!(quantity_score(&cfg, Some(15)), 50.0);
        assert_eq!(quantity_score(&cfg, Some(0)), 0.0);
        assert_eq!(quantity_score(&cfg, Some(60)), 100.0);
        assert_eq!(quantity_score(&cfg, None), cfg.unknown_quota_score);
    }

    #[test]
    fn test_quality_decay_halves_penalty_per_half_life() {
        let cfg = AccountDispatchSettings::default();
        let now = Utc::now();

        // Fresh failure: full default penalty of 10.
        let fresh = event(0, "submit", "something broke");
        let (score, _, _) = quality_score(&cfg, &[&fresh], now);
        assert!((score - 60.0).abs() < 0.5);

        // One half-life (24h) later the same failure only costs ~5.
        let old = event(24, "submit", "something broke");
        let (score, _, _) = quality_score(&cfg, &[&old], now);
        assert!((score - 65.0).abs() < 0.5);
    }

    #[test]
    fn test_ignored_events_do_not_penalise() {
        let mut cfg = AccountDispatchSettings::default();
        cfg.quality_ignore_rules = vec![crate::kernel::settings::DispatchIgnoreRule {
            phase: None,
            message_contains: "browser agent".to_string(),
        }];
        let noisy = event(0, "submit", "browser agent unreachable");
        let (score, _, _) = quality_score(&cfg, &[&noisy], Utc::now());
        assert_eq!(score, cfg.default_quality_score);
    }

    #[test]
    fn test_blocking_rule_sets_cooldown() {
        let cfg = AccountDispatchSettings::default();
        // "heavy load" rule: penalty 8, 15 min cooldown, blocking.
        let recent = event(0, "submit", "upstream heavy load detected");
        let (_, cooldown, _) = quality_score(&cfg, &[&recent], Utc::now());
        assert!(cooldown.is_some());
        assert!(cooldown.unwrap() > Utc::now());
    }

    #[test]
    fn test_quality_clamped_to_range() {
        let cfg = AccountDispatchSettings::default();
        let events: Vec<JobFailEvent> = (0..20)
            .map(|_| event(0, "publish", "boom"))
            .collect();
        let refs: Vec<&JobFailEvent> = events.iter().collect();
        let (score, _, _) = quality_score(&cfg, &refs, Utc::now());
        assert_eq!(score, 0.0);
    }
}
