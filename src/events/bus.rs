//! Event Publishing
//!
//! Producers never publish directly; they write outbox rows and the
//! drainer pushes through an [`EventPublisher`]. The in-process
//! [`BroadcastBus`] is the default implementation; tests use
//! [`RecordingPublisher`] to assert on what was emitted.

use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use super::Envelope;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError>;
}

/// In-process fan-out over a tokio broadcast channel.
///
/// Subscribers that lag are dropped by the channel, which is acceptable
/// here: durable delivery is the outbox's job, the bus only carries
/// live notifications.
pub struct BroadcastBus {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        // send() errors only when there are no subscribers; publishing
        // into the void is fine.
        let _ = self.tx.send(envelope.clone());
        Ok(())
    }
}

/// Captures every published envelope for test assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Envelope>>,
    fail: Mutex<bool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.published.lock().unwrap().clone()
    }

    pub fn count_of(&self, event_type: &str) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if *self.fail.lock().unwrap() {
            return Err(PublishError::Unavailable("recording bus told to fail".into()));
        }
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EVENT_FUNDING_SETTLED;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscriber() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();

        let env = Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", "i1", &()).unwrap();
        bus.publish(&env).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, env.id);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastBus::new(8);
        let env = Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", "i1", &()).unwrap();
        assert!(bus.publish(&env).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_publisher_counts() {
        let bus = RecordingPublisher::new();
        let env = Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", "i1", &()).unwrap();
        bus.publish(&env).await.unwrap();
        bus.publish(&env).await.unwrap();
        assert_eq!(bus.count_of(EVENT_FUNDING_SETTLED), 2);
        assert_eq!(bus.count_of("other"), 0);
    }
}
