//! Scripted stand-ins for the external collaborators.
//!
//! Each stub pops replies from a shared [`SessionScript`]; when a queue is
//! empty it falls back to a benign success reply, so tests only script the
//! interesting steps. Used by the integration suites.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::traits::{
    BrowserManager, BrowserSession, PollReply, ProfileInfo, ProfileRoute, PublishReply,
    SubmitReply, SubmitSpec, UpstreamClient, WatermarkRewriter,
};
use crate::store::scans::SessionSnapshot;

/// Reply queues shared by every stub session and the stub API client.
#[derive(Default)]
pub struct SessionScript {
    pub submits: Mutex<VecDeque<SubmitReply>>,
    pub browser_polls: Mutex<VecDeque<PollReply>>,
    pub browser_publishes: Mutex<VecDeque<PublishReply>>,
    pub api_polls: Mutex<VecDeque<PollReply>>,
    pub api_publishes: Mutex<VecDeque<PublishReply>>,
    pub opened: AtomicU32,
    pub closed: AtomicU32,
}

impl SessionScript {
    pub fn push_submit(&self, reply: SubmitReply) {
        self.submits.lock().unwrap().push_back(reply);
    }

    pub fn push_browser_poll(&self, reply: PollReply) {
        self.browser_polls.lock().unwrap().push_back(reply);
    }

    pub fn push_browser_publish(&self, reply: PublishReply) {
        self.browser_publishes.lock().unwrap().push_back(reply);
    }

    pub fn push_api_poll(&self, reply: PollReply) {
        self.api_polls.lock().unwrap().push_back(reply);
    }

    pub fn push_api_publish(&self, reply: PublishReply) {
        self.api_publishes.lock().unwrap().push_back(reply);
    }
}

pub fn ok_submit(task_id: &str) -> SubmitReply {
    SubmitReply {
        task_id: Some(task_id.to_string()),
        access_token: Some("tok_test".to_string()),
        ..Default::default()
    }
}

pub fn heavy_load_submit() -> SubmitReply {
    SubmitReply {
        error_code: Some("heavy_load".to_string()),
        error_msg: Some("Sora is under heavy load".to_string()),
        ..Default::default()
    }
}

pub fn progressing_poll(progress: f64) -> PollReply {
    PollReply {
        state: "running".to_string(),
        progress: Some(progress),
        ..Default::default()
    }
}

pub fn completed_poll(generation_id: &str) -> PollReply {
    PollReply {
        state: "completed".to_string(),
        progress: Some(100.0),
        generation_id: Some(generation_id.to_string()),
        ..Default::default()
    }
}

pub fn challenged_poll() -> PollReply {
    PollReply {
        state: "challenged".to_string(),
        cf_challenge: true,
        ..Default::default()
    }
}

pub fn ok_publish(url: &str) -> PublishReply {
    PublishReply {
        publish_url: Some(url.to_string()),
        post_id: Some("post_1".to_string()),
        permalink: Some(url.to_string()),
        ..Default::default()
    }
}

/// A publish URL that passes the runner's validation.
pub const VALID_PUBLISH_URL: &str = "https://sora.chatgpt.com/p/s_abc12345";

// ============================================================================
// Browser manager stub
// ============================================================================

pub struct StubBrowserManager {
    pub profiles: Vec<ProfileInfo>,
    pub snapshots: Mutex<HashMap<i64, SessionSnapshot>>,
    pub script: Arc<SessionScript>,
    /// When set, `open` fails for these profiles.
    pub unopenable: Mutex<Vec<i64>>,
}

impl StubBrowserManager {
    pub fn new(script: Arc<SessionScript>) -> Self {
        Self {
            profiles: Vec::new(),
            snapshots: Mutex::new(HashMap::new()),
            script,
            unopenable: Mutex::new(Vec::new()),
        }
    }

    pub fn with_profile(mut self, profile_id: i64, snapshot: SessionSnapshot) -> Self {
        self.profiles.push(ProfileInfo {
            profile_id,
            name: Some(format!("profile-{}", profile_id)),
        });
        self.snapshots.lock().unwrap().insert(profile_id, snapshot);
        self
    }
}

#[async_trait]
impl BrowserManager for StubBrowserManager {
    async fn list_profiles(&self, _group_title: &str) -> Result<Vec<ProfileInfo>> {
        Ok(self.profiles.clone())
    }

    async fn fetch_session(&self, profile_id: i64) -> Result<SessionSnapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&profile_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown profile {}", profile_id))
    }

    async fn open(&self, profile_id: i64) -> Result<Box<dyn BrowserSession>> {
        if self.unopenable.lock().unwrap().contains(&profile_id) {
            return Err(anyhow!("profile {} cannot be opened", profile_id));
        }
        self.script.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedSession {
    script: Arc<SessionScript>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn submit(&mut self, _spec: &SubmitSpec) -> Result<SubmitReply> {
        Ok(self
            .script
            .submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_submit("task_default")))
    }

    async fn poll(
        &mut self,
        task_id: &str,
        _access_token: Option<&str>,
        _want_drafts: bool,
    ) -> Result<PollReply> {
        Ok(self
            .script
            .browser_polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| completed_poll(&format!("gen_{}", task_id))))
    }

    async fn publish(&mut self, _generation_id: &str, _caption: &str) -> Result<PublishReply> {
        Ok(self
            .script
            .browser_publishes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_publish(VALID_PUBLISH_URL)))
    }

    async fn visit_feed(&mut self, _seconds: u64) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.script.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Upstream API stub
// ============================================================================

pub struct StubUpstreamClient {
    pub script: Arc<SessionScript>,
}

#[async_trait]
impl UpstreamClient for StubUpstreamClient {
    async fn poll(
        &self,
        _route: &ProfileRoute,
        task_id: &str,
        _access_token: Option<&str>,
        _want_drafts: bool,
    ) -> Result<PollReply> {
        Ok(self
            .script
            .api_polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| completed_poll(&format!("gen_{}", task_id))))
    }

    async fn publish(
        &self,
        _route: &ProfileRoute,
        _generation_id: &str,
        _caption: &str,
    ) -> Result<PublishReply> {
        Ok(self
            .script
            .api_publishes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok_publish(VALID_PUBLISH_URL)))
    }
}

// ============================================================================
// Watermark stub
// ============================================================================

pub struct StubWatermarkRewriter {
    pub replies: Mutex<VecDeque<Result<String>>>,
    pub calls: AtomicU32,
}

impl StubWatermarkRewriter {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push(&self, reply: Result<String>) {
        self.replies.lock().unwrap().push_back(reply);
    }
}

impl Default for StubWatermarkRewriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WatermarkRewriter for StubWatermarkRewriter {
    async fn rewrite(&self, publish_url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{}?clean=1", publish_url)))
    }
}
