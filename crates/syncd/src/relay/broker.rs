// In-process pub/sub for live job events, keyed the same way as the
// durable history.

use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex};

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct EventBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, job_key: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(job_key.to_string())
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish to live subscribers; returns how many received it. Channels
    /// with no subscribers are pruned so abandoned jobs do not accumulate.
    pub async fn publish(&self, job_key: &str, payload: serde_json::Value) -> usize {
        let mut channels = self.channels.lock().await;
        let Some(sender) = channels.get(job_key) else {
            return 0;
        };
        match sender.send(payload) {
            Ok(receivers) => receivers,
            Err(_) => {
                channels.remove(job_key);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::EventBroker;

    #[tokio::test]
    async fn subscribers_receive_published_payloads() {
        let broker = EventBroker::new();
        let mut rx = broker.subscribe("job:cloud:j1").await;

        assert_eq!(broker.publish("job:cloud:j1", json!({"seq": 1})).await, 1);
        assert_eq!(rx.recv().await.expect("payload should arrive"), json!({"seq": 1}));
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let broker = EventBroker::new();
        assert_eq!(broker.publish("job:cloud:j1", json!({"seq": 1})).await, 0);

        let rx = broker.subscribe("job:cloud:j1").await;
        drop(rx);
        assert_eq!(broker.publish("job:cloud:j1", json!({"seq": 2})).await, 0);
    }
}
