//! Infrastructure traits for the three external collaborators.
//!
//! These are contract seams only - no orchestration logic. The job runner
//! drives them; tests swap in the scripted stubs from `testing`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::scans::SessionSnapshot;

/// A profile listed by the browser manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileInfo {
    pub profile_id: i64,
    pub name: Option<String>,
}

/// Submission payload for one video request.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitSpec {
    pub prompt: String,
    pub image_url: Option<String>,
    pub duration: String,
    pub aspect_ratio: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitReply {
    pub task_id: Option<String>,
    pub access_token: Option<String>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

impl SubmitReply {
    /// Upstream under heavy load: do not retry on this profile.
    pub fn is_heavy_load(&self) -> bool {
        let blob = format!(
            "{} {}",
            self.error_code.as_deref().unwrap_or(""),
            self.error_msg.as_deref().unwrap_or("")
        )
        .to_ascii_lowercase();
        blob.contains("heavy_load") || blob.contains("heavy load")
    }

    pub fn error_text(&self) -> String {
        self.error_msg
            .clone()
            .or_else(|| self.error_code.clone())
            .unwrap_or_else(|| "submit failed".to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollReply {
    pub state: String,
    pub progress: Option<f64>,
    pub generation_id: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub cf_challenge: bool,
    /// Publish URL resolved from the draft record (`want_drafts` polls).
    pub draft_publish_url: Option<String>,
    pub remaining_count: Option<i64>,
    pub total_count: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishReply {
    pub publish_url: Option<String>,
    pub post_id: Option<String>,
    pub permalink: Option<String>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

impl PublishReply {
    pub fn is_duplicate(&self) -> bool {
        if self.error_code.as_deref() == Some("duplicate") {
            return true;
        }
        self.error_msg
            .as_deref()
            .map(|text| text.to_ascii_lowercase().contains("duplicate"))
            .unwrap_or(false)
    }

    /// Invalid-request errors are retried with backoff: the generation id
    /// is sometimes not committed server-side yet.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self.error_code.as_deref(),
            Some("invalid_request") | Some("invalid")
        )
    }

    pub fn error_text(&self) -> String {
        self.error_msg
            .clone()
            .or_else(|| self.error_code.clone())
            .unwrap_or_else(|| "publish failed".to_string())
    }
}

/// Network route for the proxied-API transport: the profile's proxy plus
/// the session token captured at submit time.
#[derive(Debug, Clone, Default)]
pub struct ProfileRoute {
    pub profile_id: i64,
    pub proxy_id: Option<i64>,
    pub proxy_url: Option<String>,
}

/// The external browser manager: owns profiles, their cookies, proxies and
/// fingerprints. This process never drives a browser directly.
#[async_trait]
pub trait BrowserManager: Send + Sync {
    async fn list_profiles(&self, group_title: &str) -> Result<Vec<ProfileInfo>>;

    /// Read one profile's session/quota snapshot without opening a window.
    async fn fetch_session(&self, profile_id: i64) -> Result<SessionSnapshot>;

    /// Open a profile and return a live session handle.
    async fn open(&self, profile_id: i64) -> Result<Box<dyn BrowserSession>>;
}

/// One open browser window on one profile. Never shared across jobs.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn submit(&mut self, spec: &SubmitSpec) -> Result<SubmitReply>;

    /// In-browser fetch: runs inside the page, inheriting the live session.
    async fn poll(
        &mut self,
        task_id: &str,
        access_token: Option<&str>,
        want_drafts: bool,
    ) -> Result<PollReply>;

    async fn publish(&mut self, generation_id: &str, caption: &str) -> Result<PublishReply>;

    /// Browse the feed for roughly `seconds` (nurture warm-up).
    async fn visit_feed(&mut self, seconds: u64) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Proxied-API transport: polls/publishes over plain HTTP through the
/// profile's proxy, no browser window required.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn poll(
        &self,
        route: &ProfileRoute,
        task_id: &str,
        access_token: Option<&str>,
        want_drafts: bool,
    ) -> Result<PollReply>;

    async fn publish(
        &self,
        route: &ProfileRoute,
        generation_id: &str,
        caption: &str,
    ) -> Result<PublishReply>;
}

/// Watermark-free rewrite service.
#[async_trait]
pub trait WatermarkRewriter: Send + Sync {
    /// Resolve a published video URL into a watermark-free download URL.
    async fn rewrite(&self, publish_url: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heavy_load_detection() {
        let reply = SubmitReply {
            error_code: Some("heavy_load".to_string()),
            ..Default::default()
        };
        assert!(reply.is_heavy_load());

        let reply = SubmitReply {
            error_msg: Some("Sora is under heavy load, try later".to_string()),
            ..Default::default()
        };
        assert!(reply.is_heavy_load());

        let reply = SubmitReply {
            task_id: Some("task_123".to_string()),
            ..Default::default()
        };
        assert!(!reply.is_heavy_load());
    }

    #[test]
    fn test_duplicate_publish_detection() {
        let reply = PublishReply {
            error_code: Some("duplicate".to_string()),
            ..Default::default()
        };
        assert!(reply.is_duplicate());

        let reply = PublishReply {
            error_msg: Some("Duplicate publish attempt".to_string()),
            ..Default::default()
        };
        assert!(reply.is_duplicate());
    }
}
