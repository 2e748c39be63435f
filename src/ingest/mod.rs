pub mod consumer;
pub mod queue;

pub use consumer::{ConsumerSettings, RatingConsumer};
pub use queue::{RatingQueue, RedisStreamQueue};
