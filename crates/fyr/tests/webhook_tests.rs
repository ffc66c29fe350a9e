//! Integration tests for the alert webhook.
//!
//! These drive the real router over a loopback listener and check the
//! sticky throttle as seen by an Alertmanager-style sender.

use fyr::server::{build_router, AppState};
use fyr::store::{MemoryStore, Store};
use fyr::Settings;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

// =============================================================================
// Helpers
// =============================================================================

/// Start the fyr router on a random port.
async fn start_server(secret: Option<&str>) -> (SocketAddr, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let mut settings = Settings::default();
    settings.server.alert_webhook_secret = secret.map(str::to_string);
    let app = build_router(AppState::new(Arc::new(settings), store.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, store)
}

fn alert(status: &str) -> Value {
    json!({
        "receiver": "fyr",
        "status": status,
        "alerts": [{
            "status": status,
            "labels": {"alertname": "HighErrorRate", "namespace": "shop", "service": "web"},
            "annotations": {"description": "5xx ratio above 5%"},
            "startsAt": "2024-05-01T10:00:00Z",
            "endsAt": "0001-01-01T00:00:00Z",
            "fingerprint": "fp-1"
        }]
    })
}

async fn post_json(addr: SocketAddr, body: &Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/webhook/alert"))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_repeat_and_resolve_are_not_retriggered() {
    let (addr, store) = start_server(None).await;

    let (status, first) = post_json(addr, &alert("firing")).await;
    assert_eq!(status, 202);
    assert_eq!(first, json!({"status": "accepted", "count": 1, "triggered": 1}));

    let (_, repeat) = post_json(addr, &alert("firing")).await;
    assert_eq!(repeat["triggered"], 0);

    let (_, resolved) = post_json(addr, &alert("resolved")).await;
    assert_eq!(resolved["count"], 1);
    assert_eq!(resolved["triggered"], 0);

    let state = store.get_alert_state("fp-1").await.unwrap().unwrap();
    assert_eq!(state.status.as_str(), "resolved");
    assert!(state.last_investigated_at.is_some());
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let (addr, store) = start_server(Some("s3cret")).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/webhook/alert"))
        .header("X-Alert-Token", "nope")
        .json(&alert("firing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    assert!(store.get_alert_state("fp-1").await.unwrap().is_none());

    let response = client
        .post(format!("http://{addr}/webhook/alert"))
        .bearer_auth("s3cret")
        .json(&alert("firing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (addr, _) = start_server(None).await;
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/webhook/alert"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_body_without_alerts_is_ignored() {
    let (addr, _) = start_server(None).await;
    let (status, body) = post_json(addr, &json!({"status": "firing"})).await;
    assert_eq!(status, 202);
    assert_eq!(body, json!({"status": "ignored"}));
}
