//! REST API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{ALICE_TOKEN, BOB_TOKEN, test_app};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn authed(method: Method, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .uri(uri)
        .method(method)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder.body(Body::from(value.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Session provisioning requires a bearer.
#[tokio::test]
async fn test_create_session_requires_auth() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/sessions")
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");
}

/// Provisioning creates the record, hands out the access token once, and
/// arms the relay machinery.
#[tokio::test]
async fn test_create_session() {
    let (app, state) = test_app();

    let response = app
        .oneshot(authed(
            Method::POST,
            "/api/sessions",
            ALICE_TOKEN,
            Some(json!({"initialPrompt": "hello"})),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let session_id = json["session"]["id"].as_str().unwrap().to_string();
    assert_eq!(json["session"]["status"], "starting");
    assert_eq!(json["session"]["user_id"], "alice");
    assert_eq!(json["accessToken"].as_str().unwrap().len(), 48);
    assert!(json["relayUrl"].as_str().unwrap().contains(&session_id));
    // The access token never rides on the session object itself.
    assert!(json["session"].get("access_token").is_none());

    assert!(state.registry.get(&session_id).is_some());
    assert!(state.timeouts.has(&session_id));
}

/// Sessions are invisible to non-owners.
#[tokio::test]
async fn test_get_session_hides_foreign_sessions() {
    let (app, _state) = test_app();

    let created = app
        .clone()
        .oneshot(authed(
            Method::POST,
            "/api/sessions",
            ALICE_TOKEN,
            Some(json!({})),
        ))
        .await
        .unwrap();
    let session_id = body_json(created).await["session"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let owner = app
        .clone()
        .oneshot(authed(
            Method::GET,
            &format!("/api/sessions/{session_id}"),
            ALICE_TOKEN,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);

    let other = app
        .oneshot(authed(
            Method::GET,
            &format!("/api/sessions/{session_id}"),
            BOB_TOKEN,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
}

/// Listing only returns the caller's sessions.
#[tokio::test]
async fn test_list_sessions_scoped_to_owner() {
    let (app, _state) = test_app();

    for _ in 0..2 {
        app.clone()
            .oneshot(authed(
                Method::POST,
                "/api/sessions",
                ALICE_TOKEN,
                Some(json!({})),
            ))
            .await
            .unwrap();
    }
    app.clone()
        .oneshot(authed(
            Method::POST,
            "/api/sessions",
            BOB_TOKEN,
            Some(json!({})),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(authed(Method::GET, "/api/sessions", ALICE_TOKEN, None))
        .await
        .unwrap();
    let json = body_json(response).await;
    let sessions = json.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s["user_id"] == "alice"));
}

/// Stop tears the relay down, disarms the timer, and records the status.
#[tokio::test]
async fn test_stop_session() {
    let (app, state) = test_app();

    let created = app
        .clone()
        .oneshot(authed(
            Method::POST,
            "/api/sessions",
            ALICE_TOKEN,
            Some(json!({})),
        ))
        .await
        .unwrap();
    let session_id = body_json(created).await["session"]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .oneshot(authed(
            Method::POST,
            &format!("/api/sessions/{session_id}/stop"),
            ALICE_TOKEN,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "stopped");

    assert!(state.registry.get(&session_id).is_none());
    assert!(!state.timeouts.has(&session_id));
}

/// Unknown session on stop is a 404.
#[tokio::test]
async fn test_stop_unknown_session() {
    let (app, _state) = test_app();

    let response = app
        .oneshot(authed(
            Method::POST,
            "/api/sessions/not-a-session/stop",
            ALICE_TOKEN,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
