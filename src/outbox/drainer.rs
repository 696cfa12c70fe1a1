//! Outbox Drainer
//!
//! Background worker that moves pending outbox rows onto the event bus.
//! Horizontally scalable: each instance owns one advisory-lock shard, so
//! a row is only ever drained by one worker at a time. Delivery is
//! at-least-once; consumers dedupe on the envelope id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{next_retry, OutboxError, OutboxStore};
use crate::events::EventPublisher;

#[derive(Debug, Clone)]
pub struct DrainerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Base for the retry backoff, in seconds
    pub base_retry_secs: u64,
    /// Backoff cap, in seconds
    pub max_retry_secs: u64,
    /// Advisory-lock shard this drainer owns
    pub shard: i64,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            base_retry_secs: 2,
            max_retry_secs: 300,
            shard: 0,
        }
    }
}

pub struct OutboxDrainer {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: DrainerConfig,
}

impl OutboxDrainer {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: DrainerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Run the drain loop until the process shuts down.
    pub async fn run(&self) {
        info!(
            shard = self.config.shard,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting outbox drainer"
        );

        loop {
            match self.drain_once().await {
                Ok(0) => {}
                Ok(n) => debug!(published = n, "Outbox drain cycle complete"),
                Err(e) => error!(error = %e, "Outbox drain cycle failed"),
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// One scan: claim the shard, publish due rows, release. Returns the
    /// number of rows published.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        if !self.store.try_lock_shard(self.config.shard).await? {
            debug!(shard = self.config.shard, "Shard locked by another drainer");
            return Ok(0);
        }

        let result = self.drain_locked().await;
        self.store.unlock_shard(self.config.shard).await?;
        result
    }

    async fn drain_locked(&self) -> Result<usize, OutboxError> {
        let due = self.store.fetch_due(self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(0);
        }

        // Rows come back oldest-first. A failed publish blocks the rest
        // of that aggregate for this cycle so per-aggregate order holds.
        let mut blocked: HashSet<String> = HashSet::new();
        let mut published = 0usize;

        for event in due {
            if blocked.contains(&event.aggregate_id) {
                continue;
            }

            let envelope = match event.envelope() {
                Ok(env) => env,
                Err(e) => {
                    // Unparseable payload will never succeed; push it far
                    // into the retry future and keep the error visible.
                    warn!(event_id = %event.id, error = %e, "Outbox payload failed to decode");
                    let retry = next_retry(
                        event.attempts,
                        self.config.base_retry_secs,
                        self.config.max_retry_secs,
                    );
                    self.store
                        .mark_failed(&event.id, &e.to_string(), retry)
                        .await?;
                    blocked.insert(event.aggregate_id.clone());
                    continue;
                }
            };

            match self.publisher.publish(&envelope).await {
                Ok(()) => {
                    self.store.mark_published(&event.id).await?;
                    published += 1;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        attempts = event.attempts + 1,
                        error = %e,
                        "Publish failed, scheduling retry"
                    );
                    let retry = next_retry(
                        event.attempts,
                        self.config.base_retry_secs,
                        self.config.max_retry_secs,
                    );
                    self.store
                        .mark_failed(&event.id, &e.to_string(), retry)
                        .await?;
                    blocked.insert(event.aggregate_id.clone());
                }
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, RecordingPublisher, EVENT_FUNDING_SETTLED};
    use crate::outbox::{MemoryOutboxStore, OutboxEvent};

    fn sample_event(aggregate: &str) -> OutboxEvent {
        let env =
            Envelope::new(EVENT_FUNDING_SETTLED, "t", "funding_intent", aggregate, &()).unwrap();
        OutboxEvent::from_envelope(&env).unwrap()
    }

    fn drainer(
        store: Arc<MemoryOutboxStore>,
        publisher: Arc<RecordingPublisher>,
    ) -> OutboxDrainer {
        OutboxDrainer::new(store, publisher, DrainerConfig::default())
    }

    #[tokio::test]
    async fn test_drain_publishes_and_marks() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());

        store
            .enqueue(&[sample_event("i1"), sample_event("i2")])
            .await
            .unwrap();

        let worker = drainer(store.clone(), publisher.clone());
        let published = worker.drain_once().await.unwrap();

        assert_eq!(published, 2);
        assert_eq!(publisher.count_of(EVENT_FUNDING_SETTLED), 2);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_failure_schedules_retry_and_keeps_pending() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_fail(true);

        store.enqueue(&[sample_event("i1")]).await.unwrap();

        let worker = drainer(store.clone(), publisher.clone());
        let published = worker.drain_once().await.unwrap();

        assert_eq!(published, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);

        let rows = store.all().await;
        assert_eq!(rows[0].attempts, 1);
        assert!(rows[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_aggregate_blocks_later_events_same_cycle() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        publisher.set_fail(true);

        // Two events on the same aggregate: the second must not be
        // attempted once the first fails, or ordering would invert on
        // retry.
        store
            .enqueue(&[sample_event("i1"), sample_event("i1")])
            .await
            .unwrap();

        let worker = drainer(store.clone(), publisher.clone());
        worker.drain_once().await.unwrap();

        let rows = store.all().await;
        assert_eq!(rows[0].attempts, 1);
        assert_eq!(rows[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_redelivery_after_transient_failure() {
        let store = Arc::new(MemoryOutboxStore::new());
        let publisher = Arc::new(RecordingPublisher::new());

        let mut event = sample_event("i1");
        // Pretend the first attempt already failed and the retry is due.
        event.attempts = 1;
        store.enqueue(&[event]).await.unwrap();

        let worker = drainer(store.clone(), publisher.clone());
        let published = worker.drain_once().await.unwrap();
        assert_eq!(published, 1);
        assert_eq!(publisher.count_of(EVENT_FUNDING_SETTLED), 1);
    }
}
