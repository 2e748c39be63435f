use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    db::{AggregateStore, RatingTransaction},
    engine::{AggregationEngine, QueryEngine},
    errors::AppError,
    models::{
        GameAggregate, Rating, SubmitOutcome, UserRating,
        rating::{average_hundredths, parse_id},
    },
    observability,
};

pub const DEFAULT_MAX_PAGE_SIZE: i32 = 10;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RatingService {
    store: Arc<dyn AggregateStore>,
    max_page_size: i32,
    store_timeout: Duration,
}

impl RatingService {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_max_page_size(mut self, max_page_size: i32) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn max_page_size(&self) -> i32 {
        self.max_page_size
    }

    /// Runs `fut` under the store deadline. On expiry the future is dropped,
    /// which rolls back any transaction it had open.
    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| AppError::Timeout(self.store_timeout.as_millis() as u64))?
    }

    async fn apply_submission(&self, submission: UserRating) -> Result<SubmitOutcome, AppError> {
        let mut tx = self.store.begin().await?;

        let outcome = apply_in_transaction(tx.as_mut(), &submission).await?;

        tx.commit().await?;
        Ok(outcome)
    }
}

/// The read-modify-write of one submission. Any error leaves the transaction
/// uncommitted, so nothing it wrote becomes visible.
async fn apply_in_transaction(
    tx: &mut dyn RatingTransaction,
    submission: &UserRating,
) -> Result<SubmitOutcome, AppError> {
    let game_id = submission.game_id;
    let new_rating = submission.rating.value();

    let (outcome, totals) = if tx.insert_rating_if_absent(submission).await? {
        let totals = tx.add_to_aggregate(game_id, new_rating).await?;
        (SubmitOutcome::Created, totals)
    } else {
        let old_rating = tx
            .lock_rating(submission.user_id, game_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(format!(
                    "rating for game {game_id} vanished inside its transaction"
                ))
            })?;

        if old_rating == new_rating {
            return Ok(SubmitOutcome::Unchanged);
        }

        tx.update_rating(submission).await?;
        let delta = (new_rating - old_rating) as i64;
        let totals = tx
            .shift_aggregate_sum(game_id, delta)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(format!("game {game_id} has ratings but no aggregate"))
            })?;
        (SubmitOutcome::Revised { old_rating }, totals)
    };

    let (ratings_count, ratings_sum) = totals;
    if ratings_count <= 0 {
        return Err(AppError::InternalError(format!(
            "game {game_id} would be left with count {ratings_count} and sum {ratings_sum}"
        )));
    }

    tx.set_average(game_id, average_hundredths(ratings_sum, ratings_count))
        .await?;

    Ok(outcome)
}

#[async_trait]
impl AggregationEngine for RatingService {
    async fn submit_rating(
        &self,
        user_id: &str,
        game_id: &str,
        rating: i32,
    ) -> Result<SubmitOutcome, AppError> {
        let submission = UserRating {
            user_id: parse_id("userId", user_id)?,
            game_id: parse_id("gameId", game_id)?,
            rating: Rating::new(rating)?,
        };

        let outcome = self
            .with_deadline(self.apply_submission(submission))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    game_id = %submission.game_id,
                    user_id = %submission.user_id,
                    error = %e,
                    "Failed to submit rating"
                );
            })?;

        observability::record_submission(outcome);
        match outcome {
            SubmitOutcome::Revised { old_rating } => tracing::info!(
                game_id = %submission.game_id,
                user_id = %submission.user_id,
                rating = submission.rating.value(),
                old_rating,
                outcome = outcome.as_str(),
                "Rating submitted"
            ),
            _ => tracing::info!(
                game_id = %submission.game_id,
                user_id = %submission.user_id,
                rating = submission.rating.value(),
                outcome = outcome.as_str(),
                "Rating submitted"
            ),
        }

        Ok(outcome)
    }
}

#[async_trait]
impl QueryEngine for RatingService {
    async fn get_game_aggregate(&self, game_id: &str) -> Result<GameAggregate, AppError> {
        let game_id = parse_id("gameId", game_id)?;

        let aggregate = self
            .with_deadline(self.store.fetch_aggregate(game_id))
            .await?;

        aggregate.ok_or_else(|| {
            tracing::debug!(%game_id, "No ratings for game");
            AppError::NotFound(format!("No ratings for game {game_id}"))
        })
    }

    async fn get_top_games(
        &self,
        limit: i32,
        offset: i32,
    ) -> Result<Vec<GameAggregate>, AppError> {
        if limit < 1 || limit > self.max_page_size {
            return Err(AppError::Validation(format!(
                "limit must be between 1 and {}, got {limit}",
                self.max_page_size
            )));
        }
        if offset < 0 {
            return Err(AppError::Validation(format!(
                "offset must not be negative, got {offset}"
            )));
        }

        let skip = offset as i64 * limit as i64;
        let games = self
            .with_deadline(self.store.fetch_top_games(limit as i64, skip))
            .await?;

        tracing::debug!(limit, offset, returned = games.len(), "Fetched top games");
        Ok(games)
    }
}
