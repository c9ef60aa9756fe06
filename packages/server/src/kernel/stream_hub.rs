//! In-process pub/sub for the live streaming endpoints.
//!
//! Topic-keyed broadcast channels bridge writers (event log appends, live
//! quota observations) to SSE subscribers. Topics in use: `logs`,
//! `logs:<source>`, and `quota`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

pub const TOPIC_LOGS: &str = "logs";
pub const TOPIC_QUOTA: &str = "quota";

/// Topic for one log source's stream (`logs:task`, `logs:api`, …).
pub fn log_source_topic(source: &str) -> String {
    format!("logs:{}", source)
}

#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish a JSON value to a topic. Dropped when nobody is listening.
    pub async fn publish(&self, topic: &str, value: serde_json::Value) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(topic) {
            let _ = tx.send(value);
        }
    }

    /// Publish a new event-log row to the global stream and its source
    /// sub-stream.
    pub async fn publish_log(&self, source: &str, value: serde_json::Value) {
        self.publish(TOPIC_LOGS, value.clone()).await;
        self.publish(&log_source_topic(source), value).await;
    }

    /// Subscribe to a topic, creating the channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop channels nobody subscribes to anymore.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_fanout_reaches_both_topics() {
        let hub = StreamHub::new();
        let mut all = hub.subscribe(TOPIC_LOGS).await;
        let mut task_only = hub.subscribe(&log_source_topic("task")).await;

        hub.publish_log("task", serde_json::json!({"id": 1})).await;

        assert_eq!(all.recv().await.unwrap()["id"], 1);
        assert_eq!(task_only.recv().await.unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let hub = StreamHub::new();
        hub.publish(TOPIC_QUOTA, serde_json::json!({"remaining": 3}))
            .await;
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_channels() {
        let hub = StreamHub::new();
        {
            let _rx = hub.subscribe("logs:api").await;
        }
        hub.cleanup().await;
        assert_eq!(hub.channels.read().await.len(), 0);
    }
}
