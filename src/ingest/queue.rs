use async_trait::async_trait;
use redis::{
    AsyncCommands,
    streams::{StreamReadOptions, StreamReadReply},
};

use crate::{errors::AppError, state::RedisClient};

/// Stream field holding the JSON-encoded rating message.
pub const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries delivered to this consumer earlier but never acknowledged.
    Pending,
    /// Entries never delivered to any consumer of the group.
    New,
}

/// At-least-once source of rating events.
///
/// An entry keeps being redelivered until it is acknowledged.
#[async_trait]
pub trait RatingQueue: Send + Sync {
    async fn ensure_group(&self) -> Result<(), AppError>;

    async fn read(&self, from: ReadFrom, count: usize) -> Result<Vec<QueueEntry>, AppError>;

    async fn ack(&self, id: &str) -> Result<(), AppError>;
}

/// A Redis stream read through a consumer group.
#[derive(Clone)]
pub struct RedisStreamQueue {
    redis: RedisClient,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisStreamQueue {
    pub fn new(redis: RedisClient, stream: String, group: String, consumer: String) -> Self {
        Self {
            redis,
            stream,
            group,
            consumer,
        }
    }
}

#[async_trait]
impl RatingQueue for RedisStreamQueue {
    async fn ensure_group(&self) -> Result<(), AppError> {
        let mut conn = self.redis.get().await?;

        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "$")
            .await;

        match created {
            Ok(()) => {
                tracing::info!(
                    stream = %self.stream,
                    group = %self.group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(AppError::RedisCommandError(e)),
        }
    }

    async fn read(&self, from: ReadFrom, count: usize) -> Result<Vec<QueueEntry>, AppError> {
        let mut conn = self.redis.get().await?;

        let start = match from {
            ReadFrom::Pending => "0",
            ReadFrom::New => ">",
        };
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[start], &opts)
            .await
            .map_err(AppError::RedisCommandError)?;

        let entries = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| QueueEntry {
                        payload: entry.get::<String>(PAYLOAD_FIELD),
                        id: entry.id,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(entries)
    }

    async fn ack(&self, id: &str) -> Result<(), AppError> {
        let mut conn = self.redis.get().await?;

        let _: i64 = conn
            .xack(&self.stream, &self.group, &[id])
            .await
            .map_err(AppError::RedisCommandError)?;

        Ok(())
    }
}
