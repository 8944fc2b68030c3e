use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use geomesh_db::{open_migrated_pool, DbRuntimeSettings};
use geomesh_server::{app, config::RealtimeConfig, AppState};
use geomesh_types::{topics, Presence};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn setup_app() -> (axum::Router, Arc<AppState>) {
    let pool = open_migrated_pool(":memory:", DbRuntimeSettings::default()).unwrap();
    let state = Arc::new(
        AppState::build(pool, &RealtimeConfig::default(), CancellationToken::new()).unwrap(),
    );
    (app(state.clone()), state)
}

fn json_request(method: &str, uri: &str, user: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("X-User-Id", user)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-User-Id", user)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = setup_app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_protected_routes_require_a_user() {
    let (app, _) = setup_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/location/user/alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_update_then_get_location() {
    let (app, state) = setup_app();
    let mut updates = state.bus.subscribe(topics::LOCATION_UPDATES);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/location/update",
            "alice",
            json!({"location": {"lat": 40.7128, "lng": -74.006, "accuracy": 8.0}, "presence": "busy"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["user_id"], "alice");
    assert_eq!(body["presence"], "busy");

    let broadcast = updates.try_recv().expect("location update broadcast");
    assert_eq!(broadcast.payload["user_id"], "alice");

    let response = app
        .clone()
        .oneshot(get_request("/api/location/user/alice", "bob"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user_id"], "alice");
    assert_eq!(body["location"]["lat"], 40.7128);

    let response = app
        .oneshot(get_request("/api/location/user/nobody", "bob"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_rejects_out_of_range_coordinates() {
    let (app, state) = setup_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/location/update",
            "alice",
            json!({"location": {"lat": 91.0, "lng": 0.0}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(state.spatial.get_location("alice").is_none());
}

#[tokio::test]
async fn test_nearby_and_polygon_queries() {
    let (app, _) = setup_app();
    for (user, lat) in [("alice", 10.0), ("bob", 10.0005), ("carol", 11.0)] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/location/update",
                user,
                json!({"location": {"lat": lat, "lng": 20.0}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/location/nearby",
            "alice",
            json!({"point": {"lat": 10.0, "lng": 20.0}, "radius": 500.0}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["users"][0]["user_id"], "bob");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/location/nearby",
            "alice",
            json!({"point": {"lat": 10.0, "lng": 20.0}, "radius": -1.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/location/polygon",
            "alice",
            json!({"polygon": [
                {"lat": 10.5, "lng": 19.5},
                {"lat": 11.5, "lng": 19.5},
                {"lat": 11.5, "lng": 20.5},
                {"lat": 10.5, "lng": 20.5}
            ]}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["users"][0]["user_id"], "carol");
}

#[tokio::test]
async fn test_presence_listing() {
    let (app, state) = setup_app();
    state.spatial.update_location(
        "alice",
        geomesh_types::Location::at(geomesh_types::Point::new(1.0, 1.0)),
        Presence::Away,
    );
    state.spatial.update_location(
        "bob",
        geomesh_types::Location::at(geomesh_types::Point::new(1.0, 1.0)),
        Presence::Online,
    );

    let response = app
        .clone()
        .oneshot(get_request("/api/location/presence?presence=away", "carol"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["presence"], "away");
    assert_eq!(body["count"], 1);
    assert_eq!(body["users"][0]["user_id"], "alice");

    let response = app
        .clone()
        .oneshot(get_request("/api/location/presence", "carol"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["presence"], "online");
    assert_eq!(body["users"][0]["user_id"], "bob");

    let response = app
        .oneshot(get_request("/api/location/presence?presence=asleep", "carol"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_notify_zone_reaches_users_inside() {
    let (app, state) = setup_app();
    let mut notes = state.bus.subscribe(topics::NOTIFICATIONS);
    state.spatial.update_location(
        "alice",
        geomesh_types::Location::at(geomesh_types::Point::new(5.0, 5.0)),
        Presence::Online,
    );
    state.spatial.update_location(
        "bob",
        geomesh_types::Location::at(geomesh_types::Point::new(6.0, 6.0)),
        Presence::Online,
    );

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/location/notify-zone",
            "admin",
            json!({
                "point": {"lat": 5.0, "lng": 5.0},
                "radius": 1000.0,
                "title": "Road closed",
                "message": "Use the north entrance"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["notified_count"], 1);

    let note = notes.try_recv().expect("zone notification published");
    assert_eq!(note.payload["user_id"], "alice");
    assert_eq!(note.payload["title"], "Road closed");

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/location/notify-zone",
            "admin",
            json!({"title": "nowhere", "message": "no zone given"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
