//! Typed configuration documents stored as single-row JSON blobs.
//!
//! Stored JSON is deserialized over serde defaults, so partially written
//! documents (or documents from older versions) always yield a complete
//! settings value. The admin API returns an envelope carrying both the
//! effective data and the compiled-in defaults.

use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::mask::MaskMode;
use crate::store::{LogPolicy, Store};

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub busy_retry_max: u32,
    pub busy_retry_delay_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:53200".to_string(),
            request_timeout_ms: 10_000,
            busy_retry_max: 6,
            busy_retry_delay_ms: 1_200,
        }
    }
}

/// One "ignore this failure when scoring" rule: phase (optional) plus a
/// message substring.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DispatchIgnoreRule {
    pub phase: Option<String>,
    pub message_contains: String,
}

impl DispatchIgnoreRule {
    pub fn matches(&self, phase: &str, message: &str) -> bool {
        if self.message_contains.is_empty() {
            return false;
        }
        if let Some(rule_phase) = &self.phase {
            if !rule_phase.eq_ignore_ascii_case(phase) {
                return false;
            }
        }
        message.contains(&self.message_contains)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchErrorRule {
    pub phase: Option<String>,
    pub message_contains: String,
    pub penalty: f64,
    pub cooldown_minutes: i64,
    pub block_during_cooldown: bool,
}

impl Default for DispatchErrorRule {
    fn default() -> Self {
        Self {
            phase: None,
            message_contains: String::new(),
            penalty: 10.0,
            cooldown_minutes: 30,
            block_during_cooldown: false,
        }
    }
}

impl DispatchErrorRule {
    pub fn matches(&self, phase: &str, message: &str) -> bool {
        if self.message_contains.is_empty() {
            return false;
        }
        if let Some(rule_phase) = &self.phase {
            if !rule_phase.eq_ignore_ascii_case(phase) {
                return false;
            }
        }
        message.contains(&self.message_contains)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchDefaultErrorRule {
    pub penalty: f64,
    pub cooldown_minutes: i64,
    pub block_during_cooldown: bool,
}

impl Default for DispatchDefaultErrorRule {
    fn default() -> Self {
        Self {
            penalty: 10.0,
            cooldown_minutes: 30,
            block_during_cooldown: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountDispatchSettings {
    pub enabled: bool,
    pub auto_scan_enabled: bool,
    pub auto_scan_interval_minutes: i64,
    pub auto_scan_group_title: String,
    pub lookback_hours: i64,
    pub decay_half_life_hours: i64,
    pub quantity_weight: f64,
    pub quality_weight: f64,
    pub quota_cap: i64,
    pub min_quota_remaining: i64,
    pub quota_reset_grace_minutes: i64,
    pub unknown_quota_score: f64,
    pub default_quality_score: f64,
    pub active_job_penalty: f64,
    pub plus_bonus: f64,
    pub quality_ignore_rules: Vec<DispatchIgnoreRule>,
    pub quality_error_rules: Vec<DispatchErrorRule>,
    pub default_error_rule: DispatchDefaultErrorRule,
}

impl Default for AccountDispatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_scan_enabled: true,
            auto_scan_interval_minutes: 10,
            auto_scan_group_title: "Sora".to_string(),
            lookback_hours: 72,
            decay_half_life_hours: 24,
            quantity_weight: 0.45,
            quality_weight: 0.55,
            quota_cap: 30,
            min_quota_remaining: 2,
            quota_reset_grace_minutes: 120,
            unknown_quota_score: 40.0,
            default_quality_score: 70.0,
            active_job_penalty: 8.0,
            plus_bonus: 5.0,
            quality_ignore_rules: vec![DispatchIgnoreRule {
                phase: None,
                message_contains: "browser agent".to_string(),
            }],
            quality_error_rules: vec![
                DispatchErrorRule {
                    phase: None,
                    message_contains: "heavy load".to_string(),
                    penalty: 8.0,
                    cooldown_minutes: 15,
                    block_during_cooldown: true,
                },
                DispatchErrorRule {
                    phase: None,
                    message_contains: "execution context was destroyed".to_string(),
                    penalty: 14.0,
                    cooldown_minutes: 45,
                    block_during_cooldown: false,
                },
            ],
            default_error_rule: DispatchDefaultErrorRule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoraSettings {
    pub job_max_concurrency: usize,
    pub generate_poll_interval_sec: u64,
    pub generate_max_minutes: i64,
    pub draft_wait_timeout_minutes: i64,
    pub draft_manual_poll_interval_minutes: i64,
    pub heavy_load_retry_max_attempts: i64,
    pub publish_retry_max: u32,
    pub cf_ratio_threshold: f64,
    pub cf_ratio_window_minutes: i64,
    pub default_group_title: String,
    pub default_duration: String,
    pub default_aspect_ratio: String,
    pub account_dispatch: AccountDispatchSettings,
}

impl Default for SoraSettings {
    fn default() -> Self {
        Self {
            job_max_concurrency: 2,
            generate_poll_interval_sec: 6,
            generate_max_minutes: 30,
            draft_wait_timeout_minutes: 20,
            draft_manual_poll_interval_minutes: 5,
            heavy_load_retry_max_attempts: 4,
            publish_retry_max: 5,
            cf_ratio_threshold: 0.5,
            cf_ratio_window_minutes: 30,
            default_group_title: "Sora".to_string(),
            default_duration: "10s".to_string(),
            default_aspect_ratio: "landscape".to_string(),
            account_dispatch: AccountDispatchSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub history_limit: i64,
    pub default_group_title: String,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            history_limit: 10,
            default_group_title: "Sora".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub event_log_retention_days: i64,
    pub event_log_cleanup_interval_sec: u64,
    pub event_log_max_mb: i64,
    pub api_log_capture_mode: String,
    pub api_slow_threshold_ms: i64,
    pub log_mask_mode: String,
    pub audit_log_retention_days: i64,
    pub audit_log_cleanup_interval_sec: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            event_log_retention_days: 30,
            event_log_cleanup_interval_sec: 3600,
            event_log_max_mb: 100,
            api_log_capture_mode: "all".to_string(),
            api_slow_threshold_ms: 2000,
            log_mask_mode: "basic".to_string(),
            audit_log_retention_days: 3,
            audit_log_cleanup_interval_sec: 3600,
        }
    }
}

impl LoggingSettings {
    pub fn log_policy(&self) -> LogPolicy {
        LogPolicy {
            retention_days: self.event_log_retention_days,
            cleanup_interval_sec: self.event_log_cleanup_interval_sec,
            max_mb: self.event_log_max_mb,
            mask_mode: MaskMode::parse(&self.log_mask_mode),
            audit_retention_days: self.audit_log_retention_days,
            audit_cleanup_interval_sec: self.audit_log_cleanup_interval_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub access_token_expire_minutes: i64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            // one week
            access_token_expire_minutes: 60 * 24 * 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemSettings {
    pub browser: BrowserSettings,
    pub sora: SoraSettings,
    pub scan: ScanSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSchedulerSettings {
    pub enabled: bool,
    pub times: String,
    pub timezone: String,
}

impl Default for ScanSchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            times: "09:00,13:30,21:00".to_string(),
            timezone: "Asia/Shanghai".to_string(),
        }
    }
}

impl ScanSchedulerSettings {
    /// Parse the configured `HH:MM` slots, dropping malformed entries.
    pub fn parsed_times(&self) -> Vec<String> {
        let mut slots: Vec<String> = self
            .times
            .split(',')
            .map(str::trim)
            .filter(|item| is_valid_hhmm(item))
            .map(str::to_string)
            .collect();
        slots.sort();
        slots.dedup();
        slots
    }

    pub fn validate(&self) -> Result<()> {
        let items: Vec<&str> = self
            .times
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            anyhow::bail!("times cannot be empty");
        }
        for item in &items {
            if !is_valid_hhmm(item) {
                anyhow::bail!("times format should be HH:MM, got {:?}", item);
            }
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            anyhow::bail!("unknown timezone {:?}", self.timezone);
        }
        Ok(())
    }
}

fn is_valid_hhmm(item: &str) -> bool {
    let bytes = item.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return false;
    }
    let (hh, mm) = (&item[..2], &item[3..]);
    match (hh.parse::<u32>(), mm.parse::<u32>()) {
        (Ok(hour), Ok(minute)) => hour < 24 && minute < 60,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkFreeSettings {
    pub enabled: bool,
    pub parse_method: String,
    pub custom_parse_url: Option<String>,
    pub custom_parse_token: Option<String>,
    pub custom_parse_path: String,
    pub retry_max: u32,
    pub fallback_on_failure: bool,
    pub auto_delete_published_post: bool,
}

impl Default for WatermarkFreeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            parse_method: "custom".to_string(),
            custom_parse_url: None,
            custom_parse_token: None,
            custom_parse_path: "/get-sora-link".to_string(),
            retry_max: 2,
            fallback_on_failure: true,
            auto_delete_published_post: false,
        }
    }
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SettingsEnvelope<T> {
    pub data: T,
    pub defaults: T,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub requires_restart: Vec<String>,
}

// ============================================================================
// Service
// ============================================================================

/// In-memory view of the stored settings documents, reloaded on boot and
/// refreshed on every admin PUT. Readers take cheap clones.
pub struct SettingsService {
    store: Arc<Store>,
    system: RwLock<(SystemSettings, Option<DateTime<Utc>>)>,
    scan_scheduler: RwLock<(ScanSchedulerSettings, Option<DateTime<Utc>>)>,
    watermark: RwLock<(WatermarkFreeSettings, Option<DateTime<Utc>>)>,
}

impl SettingsService {
    pub async fn load(store: Arc<Store>) -> Result<Self> {
        let system = match store.load_system_settings_doc().await? {
            Some((value, at)) => (serde_json::from_value(value)?, Some(at)),
            None => (SystemSettings::default(), None),
        };
        let scan_scheduler = match store.load_scan_scheduler_doc().await? {
            Some((value, at)) => (serde_json::from_value(value)?, Some(at)),
            None => (ScanSchedulerSettings::default(), None),
        };
        let watermark = match store.load_watermark_doc().await? {
            Some((value, at)) => (serde_json::from_value(value)?, Some(at)),
            None => (WatermarkFreeSettings::default(), None),
        };

        store.set_log_policy(system.0.logging.log_policy());

        Ok(Self {
            store,
            system: RwLock::new(system),
            scan_scheduler: RwLock::new(scan_scheduler),
            watermark: RwLock::new(watermark),
        })
    }

    pub fn system(&self) -> SystemSettings {
        self.system.read().unwrap_or_else(|e| e.into_inner()).0.clone()
    }

    pub fn scan_scheduler(&self) -> ScanSchedulerSettings {
        self.scan_scheduler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .clone()
    }

    pub fn watermark(&self) -> WatermarkFreeSettings {
        self.watermark
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .clone()
    }

    pub fn system_envelope(&self) -> SettingsEnvelope<SystemSettings> {
        let guard = self.system.read().unwrap_or_else(|e| e.into_inner());
        SettingsEnvelope {
            data: guard.0.clone(),
            defaults: SystemSettings::default(),
            updated_at: guard.1,
            requires_restart: Vec::new(),
        }
    }

    pub fn scan_scheduler_envelope(&self) -> SettingsEnvelope<ScanSchedulerSettings> {
        let guard = self.scan_scheduler.read().unwrap_or_else(|e| e.into_inner());
        SettingsEnvelope {
            data: guard.0.clone(),
            defaults: ScanSchedulerSettings::default(),
            updated_at: guard.1,
            requires_restart: Vec::new(),
        }
    }

    pub fn watermark_envelope(&self) -> SettingsEnvelope<WatermarkFreeSettings> {
        let guard = self.watermark.read().unwrap_or_else(|e| e.into_inner());
        SettingsEnvelope {
            data: guard.0.clone(),
            defaults: WatermarkFreeSettings::default(),
            updated_at: guard.1,
            requires_restart: Vec::new(),
        }
    }

    /// Persist and apply new system settings, reporting which changed paths
    /// only take effect after a restart.
    pub async fn update_system(
        &self,
        settings: SystemSettings,
    ) -> Result<SettingsEnvelope<SystemSettings>> {
        let previous = self.system();
        let mut requires_restart = Vec::new();
        if previous.sora.job_max_concurrency != settings.sora.job_max_concurrency {
            requires_restart.push("sora.job_max_concurrency".to_string());
        }

        self.store
            .save_system_settings_doc(&serde_json::to_value(&settings)?)
            .await?;
        self.store.set_log_policy(settings.logging.log_policy());

        let now = Utc::now();
        *self.system.write().unwrap_or_else(|e| e.into_inner()) = (settings.clone(), Some(now));

        Ok(SettingsEnvelope {
            data: settings,
            defaults: SystemSettings::default(),
            updated_at: Some(now),
            requires_restart,
        })
    }

    pub async fn update_scan_scheduler(
        &self,
        settings: ScanSchedulerSettings,
    ) -> Result<SettingsEnvelope<ScanSchedulerSettings>> {
        settings.validate()?;
        self.store
            .save_scan_scheduler_doc(&serde_json::to_value(&settings)?)
            .await?;
        let now = Utc::now();
        *self
            .scan_scheduler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = (settings.clone(), Some(now));
        Ok(SettingsEnvelope {
            data: settings,
            defaults: ScanSchedulerSettings::default(),
            updated_at: Some(now),
            requires_restart: Vec::new(),
        })
    }

    pub async fn update_watermark(
        &self,
        settings: WatermarkFreeSettings,
    ) -> Result<SettingsEnvelope<WatermarkFreeSettings>> {
        if !matches!(settings.parse_method.as_str(), "custom" | "third_party") {
            anyhow::bail!("parse_method must be custom or third_party");
        }

        // The rewrite client snapshots its endpoint at boot.
        let previous = self.watermark();
        let mut requires_restart = Vec::new();
        if previous.custom_parse_url != settings.custom_parse_url {
            requires_restart.push("custom_parse_url".to_string());
        }
        if previous.custom_parse_token != settings.custom_parse_token {
            requires_restart.push("custom_parse_token".to_string());
        }

        self.store
            .save_watermark_doc(&serde_json::to_value(&settings)?)
            .await?;
        let now = Utc::now();
        *self.watermark.write().unwrap_or_else(|e| e.into_inner()) = (settings.clone(), Some(now));
        Ok(SettingsEnvelope {
            data: settings,
            defaults: WatermarkFreeSettings::default(),
            updated_at: Some(now),
            requires_restart,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip() {
        let settings = SystemSettings::default();
        let json = serde_json::to_value(&settings).unwrap();
        let back: SystemSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.sora.job_max_concurrency, 2);
        assert_eq!(back.sora.account_dispatch.quota_cap, 30);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = serde_json::json!({"sora": {"job_max_concurrency": 5}});
        let settings: SystemSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.sora.job_max_concurrency, 5);
        assert_eq!(settings.sora.generate_poll_interval_sec, 6);
        assert_eq!(settings.logging.event_log_max_mb, 100);
    }

    #[test]
    fn test_scan_scheduler_times_validation() {
        let mut settings = ScanSchedulerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.parsed_times(), vec!["09:00", "13:30", "21:00"]);

        settings.times = "9:00".to_string();
        assert!(settings.validate().is_err());

        settings.times = "23:59, 00:00".to_string();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.parsed_times(), vec!["00:00", "23:59"]);

        settings.times = "  ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ignore_rule_matching() {
        let rule = DispatchIgnoreRule {
            phase: Some("publish".to_string()),
            message_contains: "publish button".to_string(),
        };
        assert!(rule.matches("publish", "no publish button found"));
        assert!(!rule.matches("submit", "no publish button found"));
        assert!(!rule.matches("publish", "something else"));
    }
}
