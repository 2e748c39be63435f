use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use game_ratings::{
    db::MemoryAggregateStore,
    engine::RatingService,
    http::{
        create_http_routes,
        handlers::rating::{SubmitRatingResponse, TopGamesResponse},
    },
    models::GameAggregate,
    state::AppState,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

fn create_router(store: MemoryAggregateStore) -> Router {
    let service = Arc::new(RatingService::new(Arc::new(store)));
    create_http_routes(AppState {
        aggregation: service.clone(),
        queries: service.clone(),
        max_page_size: service.max_page_size(),
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}

fn submit(user: &str, game: &str, rating: serde_json::Value) -> Request<Body> {
    let body = serde_json::json!({ "userId": user, "gameId": game, "rating": rating });
    Request::post("/ratings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn submit_raw(body: &str) -> Request<Body> {
    Request::post("/ratings")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_submit_then_read_back() {
    let router = create_router(MemoryAggregateStore::new());
    let game = Uuid::new_v4().to_string();

    let (status, body) = send(&router, submit(&Uuid::new_v4().to_string(), &game, 8.into())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<SubmitRatingResponse>(&body).success);

    let (status, body) = send(&router, get(&format!("/games/{game}/rating"))).await;
    assert_eq!(status, StatusCode::OK);
    let aggregate: GameAggregate = parse(&body);
    assert_eq!(aggregate.game_id.to_string(), game);
    assert_eq!(aggregate.ratings_count, 1);
    assert_eq!(aggregate.average_rating, 8.0);
}

#[tokio::test]
async fn test_invalid_submissions_are_bad_requests() {
    let router = create_router(MemoryAggregateStore::new());
    let (user, game) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    for request in [
        submit(&user, &game, 0.into()),
        submit(&user, &game, 11.into()),
        submit(&user, &game, serde_json::Value::Null),
        submit("not-a-uuid", &game, 5.into()),
        submit(&user, "", 5.into()),
    ] {
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let (status, _) = send(&router, get(&format!("/games/{game}/rating"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_badly_typed_payloads_are_bad_requests() {
    let router = create_router(MemoryAggregateStore::new());
    let (user, game) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    for request in [
        submit(&user, &game, "5".into()),
        submit(&user, &game, 5.5.into()),
        submit(&user, &game, 3_000_000_000i64.into()),
        submit(&user, &game, serde_json::json!([5])),
        submit_raw(&format!(r#"{{"userId":42,"gameId":"{game}","rating":5}}"#)),
        submit_raw(&format!(r#"{{"userId":"{user}","gameId":true,"rating":5}}"#)),
        submit_raw("{not json"),
    ] {
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    let (status, _) = send(&router, get(&format!("/games/{game}/rating"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_wrong_rating_type_names_the_field() {
    let router = create_router(MemoryAggregateStore::new());
    let (user, game) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    let (status, body) = send(&router, submit(&user, &game, "5".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8(body).unwrap().contains("rating"));
}

#[tokio::test]
async fn test_missing_rating_is_reported_as_required() {
    let router = create_router(MemoryAggregateStore::new());
    let (user, game) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    let (status, body) = send(&router, submit(&user, &game, serde_json::Value::Null)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(String::from_utf8(body).unwrap(), "rating is required");
}

#[tokio::test]
async fn test_store_outage_is_internal_error() {
    let store = MemoryAggregateStore::new();
    let router = create_router(store.clone());
    store.set_unavailable(true);

    let request = submit(
        &Uuid::new_v4().to_string(),
        &Uuid::new_v4().to_string(),
        4.into(),
    );
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_malformed_game_id_lookup_is_bad_request() {
    let router = create_router(MemoryAggregateStore::new());

    let (status, _) = send(&router, get("/games/abc/rating")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_top_games_paging_and_limit_bound() {
    let router = create_router(MemoryAggregateStore::new());

    for rating in [5, 9, 7] {
        let request = submit(
            &Uuid::new_v4().to_string(),
            &Uuid::new_v4().to_string(),
            rating.into(),
        );
        assert_eq!(send(&router, request).await.0, StatusCode::OK);
    }

    let (status, body) = send(&router, get("/games/top?limit=10&offset=0")).await;
    assert_eq!(status, StatusCode::OK);
    let top: TopGamesResponse = parse(&body);
    let averages: Vec<f64> = top.games.iter().map(|g| g.average_rating).collect();
    assert_eq!(averages, vec![9.0, 7.0, 5.0]);

    let (status, body) = send(&router, get("/games/top?limit=2&offset=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse::<TopGamesResponse>(&body).games.len(), 1);

    let (status, body) = send(&router, get("/games/top?offset=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse::<TopGamesResponse>(&body).games.is_empty());

    let (status, _) = send(&router, get("/games/top?limit=50")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health() {
    let router = create_router(MemoryAggregateStore::new());

    let (status, body) = send(&router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn test_metrics_count_submissions_by_outcome() {
    game_ratings::observability::init().unwrap();
    let router = create_router(MemoryAggregateStore::new());
    let (user, game) = (Uuid::new_v4().to_string(), Uuid::new_v4().to_string());

    for rating in [4, 9, 9] {
        assert_eq!(send(&router, submit(&user, &game, rating.into())).await.0, StatusCode::OK);
    }

    let (status, body) = send(&router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    for outcome in ["created", "revised", "unchanged"] {
        assert!(
            text.contains(&format!("game_ratings_submissions_total{{outcome=\"{outcome}\"}}")),
            "missing {outcome} in:\n{text}"
        );
    }
    assert!(text.contains("game_ratings_http_requests_total"));
    assert!(text.contains(r#"path="/ratings""#));
}
