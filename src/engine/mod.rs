pub mod service;

use async_trait::async_trait;

use crate::{
    errors::AppError,
    models::{GameAggregate, SubmitOutcome},
};

pub use service::RatingService;

/// Write side: folds one user's rating into the game's running totals.
#[async_trait]
pub trait AggregationEngine: Send + Sync {
    /// Records `rating` as the user's current rating for the game.
    ///
    /// Safe to retry after any failure: the event carries the full rating,
    /// so reapplying an already committed submission changes nothing.
    async fn submit_rating(
        &self,
        user_id: &str,
        game_id: &str,
        rating: i32,
    ) -> Result<SubmitOutcome, AppError>;
}

/// Read side over the committed aggregates.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn get_game_aggregate(&self, game_id: &str) -> Result<GameAggregate, AppError>;

    /// Page `offset` (zero-based) of games ranked by average rating.
    async fn get_top_games(&self, limit: i32, offset: i32)
    -> Result<Vec<GameAggregate>, AppError>;
}
