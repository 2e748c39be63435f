pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{GameAggregate, UserRating},
};

pub use memory::MemoryAggregateStore;
pub use postgres::PgAggregateStore;

/// Durable home of user ratings and per-game aggregates.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Opens a transaction. Dropping it without calling
    /// [`RatingTransaction::commit`] rolls every change back.
    async fn begin(&self) -> Result<Box<dyn RatingTransaction>, AppError>;

    async fn fetch_aggregate(&self, game_id: Uuid) -> Result<Option<GameAggregate>, AppError>;

    /// Aggregates ordered by average desc, count desc, game id asc.
    async fn fetch_top_games(&self, limit: i64, skip: i64)
    -> Result<Vec<GameAggregate>, AppError>;
}

/// Read-modify-write access used by a single submission.
///
/// Every row touched through a transaction stays locked against other
/// writers until it commits or is dropped.
#[async_trait]
pub trait RatingTransaction: Send {
    /// Inserts the rating if the (user, game) pair has none yet.
    /// Returns `true` when the row was created by this call.
    async fn insert_rating_if_absent(&mut self, rating: &UserRating) -> Result<bool, AppError>;

    /// Current rating for the pair, locked for the rest of the transaction.
    async fn lock_rating(&mut self, user_id: Uuid, game_id: Uuid)
    -> Result<Option<i16>, AppError>;

    async fn update_rating(&mut self, rating: &UserRating) -> Result<(), AppError>;

    /// Counts a new rating towards the game, creating its aggregate on the
    /// first rating. Returns the new `(ratings_count, ratings_sum)`.
    async fn add_to_aggregate(
        &mut self,
        game_id: Uuid,
        rating: i16,
    ) -> Result<(i64, i64), AppError>;

    /// Moves the game's sum by `delta` without changing its count.
    /// `None` when the game has no aggregate.
    async fn shift_aggregate_sum(
        &mut self,
        game_id: Uuid,
        delta: i64,
    ) -> Result<Option<(i64, i64)>, AppError>;

    async fn set_average(&mut self, game_id: Uuid, average_hundredths: i64)
    -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;
}
