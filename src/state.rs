use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::sync::Arc;

use crate::engine::{AggregationEngine, QueryEngine};

#[derive(Clone)]
pub struct AppState {
    pub aggregation: Arc<dyn AggregationEngine>,
    pub queries: Arc<dyn QueryEngine>,
    /// Upper bound accepted for `limit` on the top-games listing.
    pub max_page_size: i32,
}

pub type RedisClient = Pool<RedisConnectionManager>;
