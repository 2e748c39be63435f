use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    db::{AggregateStore, RatingTransaction},
    errors::AppError,
    models::{GameAggregate, UserRating, rating::hundredths_to_f64},
};

#[derive(Debug, Clone, Default)]
struct Totals {
    ratings_count: i64,
    ratings_sum: i64,
    average_hundredths: i64,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    ratings: HashMap<(Uuid, Uuid), i16>,
    games: HashMap<Uuid, Totals>,
}

/// Process-local store for tests and local runs without Postgres.
///
/// Transactions are fully serialized: `begin` holds the state lock until the
/// transaction commits or is dropped, and writes go to a private copy that
/// only replaces the shared state on commit.
#[derive(Clone, Default)]
pub struct MemoryAggregateStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    fail_next_average: Arc<AtomicBool>,
}

impl MemoryAggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with a transient database error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `set_average` inside a transaction fail.
    pub fn fail_next_average_write(&self) {
        self.fail_next_average.store(true, Ordering::SeqCst);
    }

    pub async fn rating_of(&self, user_id: Uuid, game_id: Uuid) -> Option<i16> {
        self.state.lock().await.ratings.get(&(user_id, game_id)).copied()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError("memory store unavailable".into()));
        }
        Ok(())
    }
}

fn to_aggregate(game_id: Uuid, totals: &Totals) -> GameAggregate {
    GameAggregate {
        game_id,
        ratings_count: totals.ratings_count,
        ratings_sum: totals.ratings_sum,
        average_rating: hundredths_to_f64(totals.average_hundredths),
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn begin(&self) -> Result<Box<dyn RatingTransaction>, AppError> {
        self.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();

        Ok(Box::new(MemoryTransaction {
            guard,
            staged,
            fail_next_average: self.fail_next_average.clone(),
        }))
    }

    async fn fetch_aggregate(&self, game_id: Uuid) -> Result<Option<GameAggregate>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .games
            .get(&game_id)
            .map(|totals| to_aggregate(game_id, totals)))
    }

    async fn fetch_top_games(
        &self,
        limit: i64,
        skip: i64,
    ) -> Result<Vec<GameAggregate>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;

        let mut games: Vec<(&Uuid, &Totals)> = state.games.iter().collect();
        games.sort_by(|(a_id, a), (b_id, b)| {
            b.average_hundredths
                .cmp(&a.average_hundredths)
                .then(b.ratings_count.cmp(&a.ratings_count))
                .then(a_id.cmp(b_id))
        });

        Ok(games
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(id, totals)| to_aggregate(*id, totals))
            .collect())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_next_average: Arc<AtomicBool>,
}

#[async_trait]
impl RatingTransaction for MemoryTransaction {
    async fn insert_rating_if_absent(&mut self, rating: &UserRating) -> Result<bool, AppError> {
        let key = (rating.user_id, rating.game_id);
        if self.staged.ratings.contains_key(&key) {
            return Ok(false);
        }
        self.staged.ratings.insert(key, rating.rating.value());
        Ok(true)
    }

    async fn lock_rating(
        &mut self,
        user_id: Uuid,
        game_id: Uuid,
    ) -> Result<Option<i16>, AppError> {
        Ok(self.staged.ratings.get(&(user_id, game_id)).copied())
    }

    async fn update_rating(&mut self, rating: &UserRating) -> Result<(), AppError> {
        if let Some(value) = self
            .staged
            .ratings
            .get_mut(&(rating.user_id, rating.game_id))
        {
            *value = rating.rating.value();
        }
        Ok(())
    }

    async fn add_to_aggregate(
        &mut self,
        game_id: Uuid,
        rating: i16,
    ) -> Result<(i64, i64), AppError> {
        let totals = self.staged.games.entry(game_id).or_default();
        totals.ratings_count += 1;
        totals.ratings_sum += rating as i64;
        Ok((totals.ratings_count, totals.ratings_sum))
    }

    async fn shift_aggregate_sum(
        &mut self,
        game_id: Uuid,
        delta: i64,
    ) -> Result<Option<(i64, i64)>, AppError> {
        Ok(self.staged.games.get_mut(&game_id).map(|totals| {
            totals.ratings_sum += delta;
            (totals.ratings_count, totals.ratings_sum)
        }))
    }

    async fn set_average(
        &mut self,
        game_id: Uuid,
        average_hundredths: i64,
    ) -> Result<(), AppError> {
        if self.fail_next_average.swap(false, Ordering::SeqCst) {
            return Err(AppError::DatabaseError("injected average write failure".into()));
        }
        if let Some(totals) = self.staged.games.get_mut(&game_id) {
            totals.average_hundredths = average_hundredths;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
