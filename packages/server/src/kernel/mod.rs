// Kernel - core infrastructure with dependency injection
//
// The Kernel holds everything the workers, schedulers, and HTTP handlers
// share: the store, the settings documents, the stream hub, and the three
// external collaborators behind their traits. It is constructed once in
// main and passed around by Arc; there is no package-level mutable state.

pub mod jobs;
pub mod nurture;
pub mod scan;
pub mod schedulers;
pub mod settings;
pub mod stream_hub;
pub mod upstream;

use std::sync::Arc;

use crate::common::mask::mask_json;
use crate::store::{NewEventLog, Store};
use settings::SettingsService;
use stream_hub::StreamHub;
use upstream::{BrowserManager, UpstreamClient, WatermarkRewriter};

pub struct Kernel {
    pub store: Arc<Store>,
    pub settings: Arc<SettingsService>,
    pub hub: StreamHub,
    pub browser: Arc<dyn BrowserManager>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub watermark: Arc<dyn WatermarkRewriter>,
}

impl Kernel {
    pub fn new(
        store: Arc<Store>,
        settings: Arc<SettingsService>,
        browser: Arc<dyn BrowserManager>,
        upstream: Arc<dyn UpstreamClient>,
        watermark: Arc<dyn WatermarkRewriter>,
    ) -> Self {
        Self {
            store,
            settings,
            hub: StreamHub::new(),
            browser,
            upstream,
            watermark,
        }
    }

    /// Append a durable event and push it to live stream subscribers.
    /// Event-log failures are logged and swallowed: observability must not
    /// kill the caller.
    pub async fn emit(&self, event: NewEventLog) -> Option<i64> {
        let source = event.source.clone();
        let mask_mode = self.store.log_policy().mask_mode;
        let mut payload = match serde_json::to_value(&event) {
            Ok(value) => mask_json(mask_mode, &value),
            Err(_) => serde_json::Value::Null,
        };

        match self.store.create_event_log(event).await {
            Ok(id) => {
                if let Some(object) = payload.as_object_mut() {
                    object.insert("id".to_string(), serde_json::json!(id));
                    object.insert(
                        "created_at".to_string(),
                        serde_json::json!(chrono::Utc::now()),
                    );
                }
                self.hub.publish_log(&source, payload).await;
                Some(id)
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to append event log");
                None
            }
        }
    }
}
