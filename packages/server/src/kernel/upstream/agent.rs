//! HTTP client for the local browser-manager agent.
//!
//! The agent (ixBrowser-style) owns the actual browser windows; this client
//! only speaks its local REST API: list profiles, read session snapshots,
//! open windows, and relay submit/poll/publish into an open window.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::traits::{
    BrowserManager, BrowserSession, PollReply, ProfileInfo, PublishReply, SubmitReply, SubmitSpec,
};
use crate::kernel::settings::BrowserSettings;
use crate::store::scans::SessionSnapshot;

pub struct BrowserAgent {
    client: reqwest::Client,
    api_base: String,
    busy_retry_max: u32,
    busy_retry_delay: Duration,
}

impl BrowserAgent {
    pub fn new(settings: &BrowserSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()
            .context("failed to build browser agent client")?;
        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            busy_retry_max: settings.busy_retry_max,
            busy_retry_delay: Duration::from_millis(settings.busy_retry_delay_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

#[derive(Deserialize)]
struct AgentProfile {
    profile_id: i64,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AgentSessionInfo {
    session_status: Option<String>,
    plan_type: Option<String>,
    remaining_count: Option<i64>,
    total_count: Option<i64>,
    reset_at: Option<chrono::DateTime<chrono::Utc>>,
    cooldown_until: Option<chrono::DateTime<chrono::Utc>>,
    profile_name: Option<String>,
}

#[derive(Deserialize)]
struct OpenReply {
    session_id: Option<String>,
    #[serde(default)]
    busy: bool,
    error: Option<String>,
}

#[async_trait]
impl BrowserManager for BrowserAgent {
    async fn list_profiles(&self, group_title: &str) -> Result<Vec<ProfileInfo>> {
        let profiles: Vec<AgentProfile> = self
            .client
            .get(self.url("/api/v1/profiles"))
            .query(&[("group_title", group_title)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(profiles
            .into_iter()
            .map(|profile| ProfileInfo {
                profile_id: profile.profile_id,
                name: profile.name,
            })
            .collect())
    }

    async fn fetch_session(&self, profile_id: i64) -> Result<SessionSnapshot> {
        let info: AgentSessionInfo = self
            .client
            .get(self.url(&format!("/api/v1/profiles/{}/session", profile_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(SessionSnapshot {
            profile_name: info.profile_name,
            session_status: info.session_status.unwrap_or_else(|| "unknown".to_string()),
            plan_type: info.plan_type.unwrap_or_else(|| "unknown".to_string()),
            remaining_count: info.remaining_count,
            total_count: info.total_count,
            reset_at: info.reset_at,
            cooldown_until: info.cooldown_until,
            error: None,
        })
    }

    async fn open(&self, profile_id: i64) -> Result<Box<dyn BrowserSession>> {
        // The agent rejects opens while another window action is in flight;
        // retry a bounded number of times before giving up.
        let mut attempt = 0u32;
        loop {
            let reply: OpenReply = self
                .client
                .post(self.url(&format!("/api/v1/profiles/{}/open", profile_id)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            if let Some(session_id) = reply.session_id {
                return Ok(Box::new(AgentSession {
                    client: self.client.clone(),
                    api_base: self.api_base.clone(),
                    session_id,
                    closed: false,
                }));
            }
            if reply.busy && attempt < self.busy_retry_max {
                attempt += 1;
                tokio::time::sleep(self.busy_retry_delay).await;
                continue;
            }
            return Err(anyhow!(
                "browser agent could not open profile {}: {}",
                profile_id,
                reply.error.unwrap_or_else(|| "busy".to_string())
            ));
        }
    }
}

/// One open window, addressed by the agent's session id.
struct AgentSession {
    client: reqwest::Client,
    api_base: String,
    session_id: String,
    closed: bool,
}

impl AgentSession {
    fn url(&self, action: &str) -> String {
        format!(
            "{}/api/v1/sessions/{}/{}",
            self.api_base, self.session_id, action
        )
    }
}

#[async_trait]
impl BrowserSession for AgentSession {
    async fn submit(&mut self, spec: &SubmitSpec) -> Result<SubmitReply> {
        let reply = self
            .client
            .post(self.url("submit"))
            .json(spec)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn poll(
        &mut self,
        task_id: &str,
        access_token: Option<&str>,
        want_drafts: bool,
    ) -> Result<PollReply> {
        let reply = self
            .client
            .post(self.url("poll"))
            .json(&json!({
                "task_id": task_id,
                "access_token": access_token,
                "want_drafts": want_drafts,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn publish(&mut self, generation_id: &str, caption: &str) -> Result<PublishReply> {
        let reply = self
            .client
            .post(self.url("publish"))
            .json(&json!({
                "generation_id": generation_id,
                "caption": caption,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    async fn visit_feed(&mut self, seconds: u64) -> Result<()> {
        self.client
            .post(self.url("visit"))
            .json(&json!({ "seconds": seconds }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.client
            .delete(format!(
                "{}/api/v1/sessions/{}",
                self.api_base, self.session_id
            ))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
