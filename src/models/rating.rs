use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

pub const MIN_RATING: i16 = 1;
pub const MAX_RATING: i16 = 10;

/// A score a user gave a game, always within `MIN_RATING..=MAX_RATING`.
///
/// Zero is not a legal rating: it is rejected like any other out-of-range
/// value rather than being read as "no rating".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Rating(i16);

impl Rating {
    pub fn new(value: i32) -> Result<Self, AppError> {
        if value < MIN_RATING as i32 || value > MAX_RATING as i32 {
            return Err(AppError::Validation(format!(
                "rating must be between {MIN_RATING} and {MAX_RATING}, got {value}"
            )));
        }
        Ok(Self(value as i16))
    }

    pub fn value(self) -> i16 {
        self.0
    }
}

/// Parses an opaque identifier. Only hyphenated UUIDs are accepted.
pub fn parse_id(field: &str, raw: &str) -> Result<Uuid, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    Uuid::try_parse(raw)
        .ok()
        .filter(|_| raw.len() == 36)
        .ok_or_else(|| AppError::Validation(format!("{field} is not a valid id: {raw}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRating {
    pub user_id: Uuid,
    pub game_id: Uuid,
    pub rating: Rating,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameAggregate {
    pub game_id: Uuid,
    pub ratings_count: i64,
    pub ratings_sum: i64,
    pub average_rating: f64,
}

/// `round(sum / count, 2)` expressed in hundredths, rounding half away from zero.
///
/// Returns 0 when `count` is not positive.
pub fn average_hundredths(sum: i64, count: i64) -> i64 {
    if count <= 0 {
        return 0;
    }
    let scaled = sum as i128 * 100;
    let count = count as i128;
    let magnitude = (scaled.abs() * 2 + count) / (count * 2);
    (if scaled < 0 { -magnitude } else { magnitude }) as i64
}

pub fn hundredths_to_f64(hundredths: i64) -> f64 {
    hundredths as f64 / 100.0
}

/// Queue payload published by the upstream catalogue service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingMessage {
    pub game_id: String,
    pub user_id: String,
    pub rating: i32,
}

/// What a committed submission did to the stored rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created,
    Revised { old_rating: i16 },
    Unchanged,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Created => "created",
            SubmitOutcome::Revised { .. } => "revised",
            SubmitOutcome::Unchanged => "unchanged",
        }
    }
}
