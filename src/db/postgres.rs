use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use uuid::Uuid;

use crate::{
    db::{AggregateStore, RatingTransaction},
    errors::AppError,
    models::{GameAggregate, UserRating},
};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {}", e)))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to run migrations: {}", e)))?;

        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(sqlx::FromRow)]
struct AggregateRow {
    game_id: Uuid,
    ratings_count: i64,
    ratings_sum: i64,
    average_rating: f64,
}

impl From<AggregateRow> for GameAggregate {
    fn from(row: AggregateRow) -> Self {
        GameAggregate {
            game_id: row.game_id,
            ratings_count: row.ratings_count,
            ratings_sum: row.ratings_sum,
            average_rating: row.average_rating,
        }
    }
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn begin(&self) -> Result<Box<dyn RatingTransaction>, AppError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to begin transaction: {}", e)))?;

        Ok(Box::new(PgRatingTransaction { tx }))
    }

    async fn fetch_aggregate(&self, game_id: Uuid) -> Result<Option<GameAggregate>, AppError> {
        let row = sqlx::query_as::<_, AggregateRow>(
            "SELECT game_id, ratings_count, ratings_sum, average_rating::float8 AS average_rating
			FROM game_ratings
			WHERE game_id = $1",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to fetch aggregate: {}", e)))?;

        Ok(row.map(GameAggregate::from))
    }

    async fn fetch_top_games(
        &self,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<GameAggregate>, AppError> {
        let rows = sqlx::query_as::<_, AggregateRow>(
            "SELECT game_id, ratings_count, ratings_sum, average_rating::float8 AS average_rating
			FROM game_ratings
			ORDER BY average_rating DESC, ratings_count DESC, game_id ASC
			LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to fetch top games: {}", e)))?;

        Ok(rows.into_iter().map(GameAggregate::from).collect())
    }
}

pub struct PgRatingTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RatingTransaction for PgRatingTransaction {
    async fn insert_rating_if_absent(&mut self, rating: &UserRating) -> Result<bool, AppError> {
        // A concurrent insert of the same pair blocks on the primary key until
        // this transaction ends, then falls through to DO NOTHING.
        let inserted = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO ratings (user_id, game_id, rating)
			VALUES ($1, $2, $3)
			ON CONFLICT (user_id, game_id) DO NOTHING
			RETURNING user_id",
        )
        .bind(rating.user_id)
        .bind(rating.game_id)
        .bind(rating.rating.value())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to insert rating: {}", e)))?;

        Ok(inserted.is_some())
    }

    async fn lock_rating(
        &mut self,
        user_id: Uuid,
        game_id: Uuid,
    ) -> Result<Option<i16>, AppError> {
        let rating = sqlx::query_scalar::<_, i16>(
            "SELECT rating FROM ratings WHERE user_id = $1 AND game_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(game_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to lock rating: {}", e)))?;

        Ok(rating)
    }

    async fn update_rating(&mut self, rating: &UserRating) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE ratings SET rating = $3, updated_at = now()
			WHERE user_id = $1 AND game_id = $2",
        )
        .bind(rating.user_id)
        .bind(rating.game_id)
        .bind(rating.rating.value())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to update rating: {}", e)))?;

        Ok(())
    }

    async fn add_to_aggregate(
        &mut self,
        game_id: Uuid,
        rating: i16,
    ) -> Result<(i64, i64), AppError> {
        // The upsert takes the row lock, so concurrent raters of one game
        // queue here and each sees the previous writer's committed totals.
        let totals = sqlx::query_as::<_, (i64, i64)>(
            "INSERT INTO game_ratings (game_id, ratings_count, ratings_sum, average_rating)
			VALUES ($1, 1, $2, 0)
			ON CONFLICT (game_id) DO UPDATE
			SET ratings_count = game_ratings.ratings_count + 1,
				ratings_sum = game_ratings.ratings_sum + EXCLUDED.ratings_sum
			RETURNING ratings_count, ratings_sum",
        )
        .bind(game_id)
        .bind(rating as i64)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to update aggregate: {}", e)))?;

        Ok(totals)
    }

    async fn shift_aggregate_sum(
        &mut self,
        game_id: Uuid,
        delta: i64,
    ) -> Result<Option<(i64, i64)>, AppError> {
        let totals = sqlx::query_as::<_, (i64, i64)>(
            "UPDATE game_ratings
			SET ratings_sum = ratings_sum + $2
			WHERE game_id = $1
			RETURNING ratings_count, ratings_sum",
        )
        .bind(game_id)
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to update aggregate: {}", e)))?;

        Ok(totals)
    }

    async fn set_average(
        &mut self,
        game_id: Uuid,
        average_hundredths: i64,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE game_ratings
			SET average_rating = $2::numeric / 100
			WHERE game_id = $1",
        )
        .bind(game_id)
        .bind(average_hundredths)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(format!("Failed to store average: {}", e)))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let this = *self;
        this.tx
            .commit()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to commit: {}", e)))
    }
}
