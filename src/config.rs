use std::{str::FromStr, time::Duration};

use crate::{errors::AppError, ingest::ConsumerSettings};

#[derive(Debug, Clone)]
pub struct Config {
    pub env: String,
    pub database_url: String,
    pub pg_pool_max: u32,
    pub redis_url: String,
    pub ratings_stream: String,
    pub ratings_group: String,
    pub ratings_consumer: String,
    pub ingest_batch_size: usize,
    pub ingest_poll_ms: u64,
    pub ingest_retry_base_ms: u64,
    pub top_games_max_limit: i32,
    pub store_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub rate_limit_per_minute: u32,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::EnvError(format!("{key} must be set")))
        };
        let or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            env: or("APP_ENV", "local"),
            database_url: required("DATABASE_URL")?,
            pg_pool_max: parse(&lookup, "PG_POOL_MAX", 20)?,
            redis_url: required("REDIS_URL")?,
            ratings_stream: or("RATINGS_STREAM", "ratings"),
            ratings_group: or("RATINGS_GROUP", "rating-service"),
            ratings_consumer: or("RATINGS_CONSUMER", "rating-service-1"),
            ingest_batch_size: parse(&lookup, "INGEST_BATCH_SIZE", 32)?,
            ingest_poll_ms: parse(&lookup, "INGEST_POLL_MS", 500)?,
            ingest_retry_base_ms: parse(&lookup, "INGEST_RETRY_BASE_MS", 200)?,
            top_games_max_limit: parse(&lookup, "TOP_GAMES_MAX_LIMIT", 10)?,
            store_timeout_ms: parse(&lookup, "STORE_TIMEOUT_MS", 5000)?,
            request_timeout_ms: parse(&lookup, "REQUEST_TIMEOUT_MS", 10_000)?,
            port: parse(&lookup, "PORT", 3001)?,
            allowed_origins: or("ALLOWED_ORIGINS", "http://localhost:3000")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            rate_limit_per_minute: parse(&lookup, "RATE_LIMIT_PER_MINUTE", 1000)?,
        };

        if config.top_games_max_limit < 1 {
            return Err(AppError::EnvError(
                "TOP_GAMES_MAX_LIMIT must be at least 1".into(),
            ));
        }
        if config.rate_limit_per_minute == 0 || config.ingest_batch_size == 0 {
            return Err(AppError::EnvError(
                "RATE_LIMIT_PER_MINUTE and INGEST_BATCH_SIZE must be positive".into(),
            ));
        }

        Ok(config)
    }

    pub fn is_local(&self) -> bool {
        self.env == "local"
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            batch_size: self.ingest_batch_size,
            poll_interval: Duration::from_millis(self.ingest_poll_ms),
            retry_base: Duration::from_millis(self.ingest_retry_base_ms),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::EnvError(format!("{key} is invalid ({raw}): {e}"))),
    }
}
