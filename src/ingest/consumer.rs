use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

use crate::{
    engine::AggregationEngine,
    errors::AppError,
    ingest::queue::{QueueEntry, RatingQueue, ReadFrom},
    models::{RatingMessage, SubmitOutcome},
    observability::{self, IngestResult},
};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry_base: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            poll_interval: Duration::from_millis(500),
            retry_base: Duration::from_millis(200),
        }
    }
}

/// What to do with a queue entry once the engine has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Applied, or permanently unprocessable: advance past it.
    Ack,
    /// The store failed transiently: keep the entry and try again.
    Retry,
}

pub fn disposition(result: &Result<SubmitOutcome, AppError>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) if e.is_transient() => Disposition::Retry,
        Err(_) => Disposition::Ack,
    }
}

pub fn decode(entry: &QueueEntry) -> Result<RatingMessage, AppError> {
    let payload = entry
        .payload
        .as_deref()
        .ok_or_else(|| AppError::MalformedMessage("entry has no payload field".into()))?;

    serde_json::from_str(payload).map_err(|e| AppError::MalformedMessage(e.to_string()))
}

fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
        .min(MAX_RETRY_DELAY)
}

/// Sleeps for `duration` unless shutdown is signalled first.
/// Returns `true` when the caller should stop.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Feeds queued rating events into the aggregation engine.
pub struct RatingConsumer {
    queue: Arc<dyn RatingQueue>,
    engine: Arc<dyn AggregationEngine>,
    settings: ConsumerSettings,
}

impl RatingConsumer {
    pub fn new(
        queue: Arc<dyn RatingQueue>,
        engine: Arc<dyn AggregationEngine>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            queue,
            engine,
            settings,
        }
    }

    /// Consumes until `shutdown` flips to `true`.
    ///
    /// Entries left pending by an earlier run are drained before new ones.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Starting rating consumer");

        let mut attempt = 0;
        loop {
            match self.queue.ensure_group().await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    tracing::error!(error = %e, attempt, "Failed to prepare consumer group");
                    let delay = retry_delay(self.settings.retry_base, attempt);
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        tracing::info!("Rating consumer stopped");
                        return;
                    }
                }
            }
        }

        let mut from = ReadFrom::Pending;
        let mut read_failures = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let entries = match self.queue.read(from, self.settings.batch_size).await {
                Ok(entries) => {
                    read_failures = 0;
                    entries
                }
                Err(e) => {
                    read_failures += 1;
                    tracing::warn!(error = %e, "Failed to read rating stream");
                    let delay = retry_delay(self.settings.retry_base, read_failures);
                    if sleep_or_shutdown(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if entries.is_empty() {
                if from == ReadFrom::Pending {
                    tracing::debug!("No pending entries left, reading new ones");
                    from = ReadFrom::New;
                    continue;
                }
                if sleep_or_shutdown(self.settings.poll_interval, &mut shutdown).await {
                    break;
                }
                continue;
            }

            for entry in &entries {
                if !self.handle_entry(entry, &mut shutdown).await {
                    tracing::info!("Rating consumer stopped");
                    return;
                }
            }
        }

        tracing::info!("Rating consumer stopped");
    }

    /// Returns `false` when shutdown interrupted a retry; the entry then
    /// stays unacknowledged and is redelivered on the next start.
    async fn handle_entry(&self, entry: &QueueEntry, shutdown: &mut watch::Receiver<bool>) -> bool {
        let message = match decode(entry) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    entry_id = %entry.id,
                    error = %e,
                    "Dropping malformed rating message"
                );
                observability::record_ingest(IngestResult::Dropped);
                self.ack(entry).await;
                return true;
            }
        };

        let mut attempt = 0;
        loop {
            let result = self
                .engine
                .submit_rating(&message.user_id, &message.game_id, message.rating)
                .await;

            match (disposition(&result), result) {
                (Disposition::Ack, Ok(outcome)) => {
                    tracing::debug!(
                        entry_id = %entry.id,
                        outcome = outcome.as_str(),
                        "Applied rating message"
                    );
                    observability::record_ingest(IngestResult::Acked);
                    self.ack(entry).await;
                    return true;
                }
                (Disposition::Ack, Err(e)) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        game_id = %message.game_id,
                        user_id = %message.user_id,
                        error = %e,
                        "Dropping rating message the engine rejected"
                    );
                    observability::record_ingest(IngestResult::Dropped);
                    self.ack(entry).await;
                    return true;
                }
                (Disposition::Retry, result) => {
                    attempt += 1;
                    let delay = retry_delay(self.settings.retry_base, attempt);
                    tracing::warn!(
                        entry_id = %entry.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = ?result.err(),
                        "Rating store unavailable, retrying message"
                    );
                    observability::record_ingest(IngestResult::Retried);
                    if sleep_or_shutdown(delay, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn ack(&self, entry: &QueueEntry) {
        // A lost ack only means a redelivery, which the engine absorbs.
        if let Err(e) = self.queue.ack(&entry.id).await {
            tracing::warn!(entry_id = %entry.id, error = %e, "Failed to acknowledge entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{AggregateStore, MemoryAggregateStore},
        engine::RatingService,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeQueue {
        unread: Mutex<VecDeque<QueueEntry>>,
        pending: Mutex<Vec<QueueEntry>>,
        acked: Mutex<Vec<String>>,
    }

    impl FakeQueue {
        async fn push(&self, id: &str, payload: Option<&str>) {
            self.unread.lock().await.push_back(QueueEntry {
                id: id.into(),
                payload: payload.map(str::to_string),
            });
        }

        async fn acked(&self) -> Vec<String> {
            self.acked.lock().await.clone()
        }
    }

    #[async_trait]
    impl RatingQueue for FakeQueue {
        async fn ensure_group(&self) -> Result<(), AppError> {
            Ok(())
        }

        async fn read(&self, from: ReadFrom, count: usize) -> Result<Vec<QueueEntry>, AppError> {
            match from {
                ReadFrom::Pending => Ok(self
                    .pending
                    .lock()
                    .await
                    .iter()
                    .take(count)
                    .cloned()
                    .collect()),
                ReadFrom::New => {
                    let mut unread = self.unread.lock().await;
                    let n = count.min(unread.len());
                    let batch: Vec<QueueEntry> = unread.drain(..n).collect();
                    self.pending.lock().await.extend(batch.iter().cloned());
                    Ok(batch)
                }
            }
        }

        async fn ack(&self, id: &str) -> Result<(), AppError> {
            self.pending.lock().await.retain(|e| e.id != id);
            self.acked.lock().await.push(id.to_string());
            Ok(())
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            batch_size: 8,
            poll_interval: Duration::from_millis(5),
            retry_base: Duration::from_millis(5),
        }
    }

    fn payload(user: Uuid, game: Uuid, rating: i32) -> String {
        serde_json::to_string(&RatingMessage {
            game_id: game.to_string(),
            user_id: user.to_string(),
            rating,
        })
        .unwrap()
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn transient_errors_are_retried_and_others_acked() {
        assert_eq!(disposition(&Ok(SubmitOutcome::Created)), Disposition::Ack);
        assert_eq!(
            disposition(&Err(AppError::Validation("rating".into()))),
            Disposition::Ack
        );
        assert_eq!(
            disposition(&Err(AppError::DatabaseError("down".into()))),
            Disposition::Retry
        );
        assert_eq!(disposition(&Err(AppError::Timeout(1))), Disposition::Retry);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(base, 40), MAX_RETRY_DELAY);
    }

    #[test]
    fn decode_rejects_missing_or_invalid_payload() {
        let missing = QueueEntry {
            id: "1-0".into(),
            payload: None,
        };
        assert!(matches!(decode(&missing), Err(AppError::MalformedMessage(_))));

        let junk = QueueEntry {
            id: "2-0".into(),
            payload: Some("{not json".into()),
        };
        assert!(matches!(decode(&junk), Err(AppError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn applies_messages_and_drops_malformed_ones() {
        let store = MemoryAggregateStore::new();
        let engine = Arc::new(RatingService::new(Arc::new(store.clone())));
        let queue = Arc::new(FakeQueue::default());
        let (user_a, user_b, game) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        queue.push("1-0", Some(&payload(user_a, game, 8))).await;
        queue.push("2-0", Some("garbage")).await;
        queue.push("3-0", Some(&payload(user_b, game, 6))).await;
        queue.push("4-0", Some(&payload(user_b, game, 42))).await;
        queue.push("5-0", Some(&payload(user_a, game, 8))).await;

        let (tx, rx) = watch::channel(false);
        let consumer = RatingConsumer::new(queue.clone(), engine, settings());
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        wait_for(|| async { queue.acked().await.len() == 5 }).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.acked().await, vec!["1-0", "2-0", "3-0", "4-0", "5-0"]);
        let aggregate = store.fetch_aggregate(game).await.unwrap().unwrap();
        assert_eq!(aggregate.ratings_count, 2);
        assert_eq!(aggregate.ratings_sum, 14);
        assert_eq!(aggregate.average_rating, 7.0);
    }

    #[tokio::test]
    async fn transient_failures_hold_the_entry_until_the_store_recovers() {
        let store = MemoryAggregateStore::new();
        let engine = Arc::new(RatingService::new(Arc::new(store.clone())));
        let queue = Arc::new(FakeQueue::default());
        let (user, game) = (Uuid::new_v4(), Uuid::new_v4());

        store.set_unavailable(true);
        queue.push("1-0", Some(&payload(user, game, 5))).await;

        let (tx, rx) = watch::channel(false);
        let consumer = RatingConsumer::new(queue.clone(), engine, settings());
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        wait_for(|| async { !queue.pending.lock().await.is_empty() }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.acked().await.is_empty());

        store.set_unavailable(false);
        wait_for(|| async { queue.acked().await == vec!["1-0".to_string()] }).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.rating_of(user, game).await, Some(5));
    }

    #[tokio::test]
    async fn shutdown_during_retry_leaves_entry_pending_for_redelivery() {
        let store = MemoryAggregateStore::new();
        let engine = Arc::new(RatingService::new(Arc::new(store.clone())));
        let queue = Arc::new(FakeQueue::default());
        let (user, game) = (Uuid::new_v4(), Uuid::new_v4());

        store.set_unavailable(true);
        queue.push("1-0", Some(&payload(user, game, 3))).await;

        let (tx, rx) = watch::channel(false);
        let consumer = RatingConsumer::new(queue.clone(), engine.clone(), settings());
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        wait_for(|| async { !queue.pending.lock().await.is_empty() }).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(queue.acked().await.is_empty());

        // A restarted consumer picks the pending entry up first.
        store.set_unavailable(false);
        let (tx, rx) = watch::channel(false);
        let consumer = RatingConsumer::new(queue.clone(), engine, settings());
        let handle = tokio::spawn(async move { consumer.run(rx).await });

        wait_for(|| async { queue.acked().await == vec!["1-0".to_string()] }).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.rating_of(user, game).await, Some(3));
    }
}
