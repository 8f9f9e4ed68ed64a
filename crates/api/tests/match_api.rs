//! `/api/v1/matches` endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_json, build_test_app, get, post_json, test_state};
use serde_json::json;
use tandem_core::types::new_id;

async fn pair(app: &axum::Router, first: uuid::Uuid, second: uuid::Uuid) -> serde_json::Value {
    let response = post_json(
        app.clone(),
        "/api/v1/matches/pair",
        json!({ "first": first, "second": second, "duration_minutes": 25, "theme": "" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"].clone()
}

// ---------------------------------------------------------------------------
// Test: heartbeat and ready handshake over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ready_handshake_activates_the_match() {
    let app = build_test_app(test_state());
    let (ada, bo) = (new_id(), new_id());
    let m = pair(&app, ada, bo).await;
    let id = m["id"].as_str().unwrap();
    assert_eq!(m["state"], "preparing");
    assert_eq!(m["theme"], "rainy_cafe");

    let beat = post_json(app.clone(), &format!("/api/v1/matches/{id}/heartbeat"), json!({ "user_id": ada })).await;
    assert_eq!(beat.status(), StatusCode::OK);
    let beat = body_json(beat).await;
    assert_eq!(beat["data"]["partner_alive"], true);
    assert_eq!(beat["data"]["match_state"], "preparing");

    let first = body_json(post_json(app.clone(), &format!("/api/v1/matches/{id}/ready"), json!({ "user_id": ada })).await).await;
    assert_eq!(first["data"]["both_ready"], false);
    let second = body_json(post_json(app.clone(), &format!("/api/v1/matches/{id}/ready"), json!({ "user_id": bo })).await).await;
    assert_eq!(second["data"]["both_ready"], true);

    let row = body_json(get(app.clone(), &format!("/api/v1/matches/{id}")).await).await;
    assert_eq!(row["data"]["state"], "active");
    let session_id = row["data"]["session_id"].as_str().unwrap();
    let session = body_json(get(app, &format!("/api/v1/sessions/{session_id}")).await).await;
    assert_eq!(session["data"]["status"], "active");
}

// ---------------------------------------------------------------------------
// Test: break is idempotent and keeps the first reason
// ---------------------------------------------------------------------------

#[tokio::test]
async fn break_keeps_the_first_reason() {
    let app = build_test_app(test_state());
    let m = pair(&app, new_id(), new_id()).await;
    let id = m["id"].as_str().unwrap();

    let first = post_json(app.clone(), &format!("/api/v1/matches/{id}/break"), json!({ "reason": "user_exit" })).await;
    assert_eq!(first.status(), StatusCode::NO_CONTENT);
    let second = post_json(app.clone(), &format!("/api/v1/matches/{id}/break"), json!({ "reason": "partner_timeout" })).await;
    assert_eq!(second.status(), StatusCode::NO_CONTENT);

    let row = body_json(get(app, &format!("/api/v1/matches/{id}")).await).await;
    assert_eq!(row["data"]["state"], "broken");
    assert_eq!(row["data"]["broken_reason"], "user_exit");
}

// ---------------------------------------------------------------------------
// Test: requeue opens a fresh match that can be seated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requeue_returns_a_fresh_match() {
    let app = build_test_app(test_state());
    let (ada, cy) = (new_id(), new_id());

    let response = post_json(
        app.clone(),
        "/api/v1/matches/requeue",
        json!({ "user_id": ada, "duration_minutes": 25, "theme": "forest" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let match_id = body_json(response).await["data"]["match_id"]
        .as_str()
        .unwrap()
        .to_string();

    let seated = post_json(app.clone(), &format!("/api/v1/matches/{match_id}/seat"), json!({ "user_id": cy })).await;
    assert_eq!(seated.status(), StatusCode::OK);
    assert_eq!(body_json(seated).await["data"]["theme"], "forest");

    let full = post_json(app, &format!("/api/v1/matches/{match_id}/seat"), json!({ "user_id": new_id() })).await;
    assert_eq!(full.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn pairing_a_user_with_themselves_is_rejected() {
    let app = build_test_app(test_state());
    let user = new_id();
    let response = post_json(
        app,
        "/api/v1/matches/pair",
        json!({ "first": user, "second": user, "duration_minutes": 25, "theme": "" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
