use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

use crate::{errors::AppError, models::GameAggregate, state::AppState};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRatingPayload {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub game_id: String,
    pub rating: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRatingResponse {
    pub success: bool,
}

#[derive(Deserialize)]
pub struct TopGamesQuery {
    pub limit: Option<i32>,
    pub offset: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopGamesResponse {
    pub games: Vec<GameAggregate>,
}

pub async fn submit_rating_handler(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRatingPayload>, JsonRejection>,
) -> Result<Json<SubmitRatingResponse>, (StatusCode, String)> {
    let Json(payload) = payload.map_err(|rejection| {
        tracing::debug!("Rejected rating payload: {}", rejection.body_text());
        AppError::Validation(rejection.body_text()).to_response()
    })?;

    let rating = payload
        .rating
        .ok_or_else(|| AppError::Validation("rating is required".into()).to_response())?;

    match state
        .aggregation
        .submit_rating(&payload.user_id, &payload.game_id, rating)
        .await
    {
        Ok(_) => Ok(Json(SubmitRatingResponse { success: true })),
        Err(err) => {
            if err.is_transient() {
                tracing::error!("Error submitting rating: {}", err);
            } else {
                tracing::debug!("Rejected rating submission: {}", err);
            }
            Err(err.to_response())
        }
    }
}

pub async fn get_game_rating_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameAggregate>, (StatusCode, String)> {
    let aggregate = state
        .queries
        .get_game_aggregate(&game_id)
        .await
        .map_err(|e| {
            if let AppError::NotFound(_) | AppError::Validation(_) = e {
                tracing::debug!("Game rating lookup failed: {}", e);
            } else {
                tracing::error!("Error retrieving game rating: {}", e);
            }
            e.to_response()
        })?;

    Ok(Json(aggregate))
}

pub async fn get_top_games_handler(
    State(state): State<AppState>,
    Query(query): Query<TopGamesQuery>,
) -> Result<Json<TopGamesResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(state.max_page_size);
    let offset = query.offset.unwrap_or(0);

    let games = state
        .queries
        .get_top_games(limit, offset)
        .await
        .map_err(|e| {
            if e.is_transient() {
                tracing::error!("Failed to get top games: {}", e);
            } else {
                tracing::debug!("Rejected top games query: {}", e);
            }
            e.to_response()
        })?;

    Ok(Json(TopGamesResponse { games }))
}

pub async fn health_handler() -> &'static str {
    "ok"
}
