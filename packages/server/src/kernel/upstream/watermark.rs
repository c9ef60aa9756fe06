//! Watermark-free rewrite via the configured parse service.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::traits::WatermarkRewriter;
use crate::kernel::settings::WatermarkFreeSettings;

pub struct HttpWatermarkRewriter {
    client: reqwest::Client,
    settings: WatermarkFreeSettings,
}

#[derive(Deserialize)]
struct ParseReply {
    output_url: Option<String>,
    url: Option<String>,
    error: Option<String>,
}

impl HttpWatermarkRewriter {
    pub fn new(settings: WatermarkFreeSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build watermark client")?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self) -> Result<String> {
        let base = self
            .settings
            .custom_parse_url
            .as_deref()
            .ok_or_else(|| anyhow!("custom_parse_url is not configured"))?;
        Ok(format!(
            "{}{}",
            base.trim_end_matches('/'),
            self.settings.custom_parse_path
        ))
    }
}

#[async_trait]
impl WatermarkRewriter for HttpWatermarkRewriter {
    async fn rewrite(&self, publish_url: &str) -> Result<String> {
        let endpoint = self.endpoint()?;
        let mut request = self.client.post(&endpoint).json(&json!({ "url": publish_url }));
        if let Some(token) = &self.settings.custom_parse_token {
            request = request.bearer_auth(token);
        }
        let reply: ParseReply = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed parse-service response")?;

        reply
            .output_url
            .or(reply.url)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "parse service returned no url: {}",
                    reply.error.unwrap_or_else(|| "unknown error".to_string())
                )
            })
    }
}
