use axum::{
    Router, middleware,
    routing::{get, post},
};

use crate::{
    http::handlers::{
        get_game_rating_handler, get_top_games_handler, health_handler, submit_rating_handler,
    },
    observability::{metrics_handler, track_http_metrics},
    state::AppState,
};

pub fn create_http_routes(state: AppState) -> Router {
    Router::new()
        .route("/ratings", post(submit_rating_handler))
        .route("/games/top", get(get_top_games_handler))
        .route("/games/{game_id}/rating", get(get_game_rating_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn(track_http_metrics))
        .with_state(state)
}
