//! Proxied-API transport: polls and publishes over plain HTTP through the
//! profile's proxy. Cheaper than keeping a window open, but exposed to
//! anti-bot challenges; the runner fails over to the in-browser transport
//! when a challenge is detected.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use super::traits::{PollReply, ProfileRoute, PublishReply, UpstreamClient};

pub struct HttpUpstreamClient {
    base_url: String,
    timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(base_url: &str, timeout_ms: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Each route gets its own client so the profile's proxy applies.
    fn client_for(&self, route: &ProfileRoute) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy_url) = &route.proxy_url {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy_url)
                    .with_context(|| format!("invalid proxy url for profile {}", route.profile_id))?,
            );
        }
        builder.build().context("failed to build upstream client")
    }

    /// Challenge markers: interstitial status codes plus the mitigation
    /// header or challenge strings in the body.
    fn looks_like_challenge(status: reqwest::StatusCode, headers: &reqwest::header::HeaderMap, body: &str) -> bool {
        if headers.contains_key("cf-mitigated") {
            return true;
        }
        if status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            let lowered = body.to_ascii_lowercase();
            return lowered.contains("cf-chl") || lowered.contains("challenge");
        }
        false
    }

    async fn parse_poll(response: reqwest::Response) -> Result<PollReply> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        if Self::looks_like_challenge(status, &headers, &body) {
            return Ok(PollReply {
                state: "challenged".to_string(),
                cf_challenge: true,
                ..Default::default()
            });
        }
        if !status.is_success() {
            return Ok(PollReply {
                state: "error".to_string(),
                error: Some(format!("upstream returned {}", status)),
                ..Default::default()
            });
        }
        let reply = serde_json::from_str(&body).context("malformed poll response")?;
        Ok(reply)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn poll(
        &self,
        route: &ProfileRoute,
        task_id: &str,
        access_token: Option<&str>,
        want_drafts: bool,
    ) -> Result<PollReply> {
        let client = self.client_for(route)?;
        let mut request = client
            .get(format!("{}/tasks/{}", self.base_url, task_id))
            .query(&[("drafts", want_drafts.to_string())]);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        Self::parse_poll(response).await
    }

    async fn publish(
        &self,
        route: &ProfileRoute,
        generation_id: &str,
        caption: &str,
    ) -> Result<PublishReply> {
        let client = self.client_for(route)?;
        let response = client
            .post(format!("{}/publish", self.base_url))
            .json(&json!({
                "generation_id": generation_id,
                "caption": caption,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Ok(PublishReply {
                error_code: Some(status.as_u16().to_string()),
                error_msg: Some(body.chars().take(200).collect()),
                ..Default::default()
            });
        }
        let reply = serde_json::from_str(&body).context("malformed publish response")?;
        Ok(reply)
    }
}
