use geomesh_db::{open_migrated_pool, DbRuntimeSettings};
use geomesh_server::{app, config::RealtimeConfig, start_background, AppState};
use geomesh_types::topics;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn start_server() -> (String, Arc<AppState>) {
    let pool = open_migrated_pool(":memory:", DbRuntimeSettings::default()).unwrap();
    let state = Arc::new(
        AppState::build(pool, &RealtimeConfig::default(), CancellationToken::new()).unwrap(),
    );
    start_background(&state);

    let app = app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("http://{}", addr), state)
}

/// Reads chunks until the accumulated text contains `needle`.
async fn read_until(response: &mut reqwest::Response, needle: &str) -> String {
    let mut seen = String::new();
    tokio::time::timeout(Duration::from_secs(3), async {
        while !seen.contains(needle) {
            let chunk = response
                .chunk()
                .await
                .expect("Failed to read chunk")
                .expect("Stream closed");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {seen:?}"));
    seen
}

#[tokio::test]
async fn test_user_stream_starts_connected_and_delivers_notifications() {
    let (server_url, state) = start_server().await;

    let client = reqwest::Client::new();
    let mut response = client
        .get(format!("{}/api/user/sse", server_url))
        .header("X-User-Id", "alice")
        .send()
        .await
        .expect("Failed to connect to SSE stream");
    assert!(response.status().is_success());

    let first = read_until(&mut response, "connected").await;
    assert!(first.starts_with("data:"));
    assert!(first.contains("alice"));
    assert!(state.router.has_push_channel("alice"));

    state.bus.publish_json(
        topics::NOTIFICATIONS,
        &json!({"user_id": "alice", "title": "Package delivered"}),
    );
    state.bus.publish_json(
        topics::NOTIFICATIONS,
        &json!({"user_id": "bob", "title": "Not for alice"}),
    );
    state.bus.publish_json(
        topics::CHAT_INVITES,
        &json!({"user_id": "alice", "fence_id": "f1"}),
    );

    let seen = read_until(&mut response, "chat_invite").await;
    assert!(seen.contains("Package delivered"));
    assert!(!seen.contains("Not for alice"));
}

#[tokio::test]
async fn test_user_stream_requires_auth() {
    let (server_url, _) = start_server().await;
    let response = reqwest::get(format!("{}/api/user/sse", server_url))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dropping_the_stream_closes_the_push_channel() {
    let (server_url, state) = start_server().await;

    let client = reqwest::Client::new();
    let mut response = client
        .get(format!("{}/api/user/sse", server_url))
        .header("X-User-Id", "carol")
        .send()
        .await
        .unwrap();
    read_until(&mut response, "connected").await;
    drop(response);

    let mut closed = false;
    for _ in 0..100 {
        if !state.router.has_push_channel("carol") {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "push channel still open after client left");
}

#[tokio::test]
async fn test_topic_stream_relays_payloads() {
    let (server_url, state) = start_server().await;

    let mut response = reqwest::get(format!("{}/api/events/{}", server_url, topics::POST_EVENTS))
        .await
        .expect("Failed to connect to topic stream");
    assert!(response.status().is_success());
    assert_eq!(state.bus.subscriber_count(topics::POST_EVENTS), 1);

    state.bus.publish_json(
        topics::POST_EVENTS,
        &json!({"type": "new_post", "post_id": "p-42"}),
    );

    let seen = read_until(&mut response, "p-42").await;
    assert!(seen.starts_with("data:"));
    assert!(seen.contains("new_post"));
}

#[tokio::test]
async fn test_streams_end_on_shutdown() {
    let (server_url, state) = start_server().await;

    let mut response = reqwest::get(format!("{}/api/events/{}", server_url, topics::ADS))
        .await
        .unwrap();
    assert!(response.status().is_success());

    state.shutdown.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match response.chunk().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "topic stream kept running after shutdown");
}
