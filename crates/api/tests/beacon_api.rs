//! Unload beacon endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_json, build_test_app, get, post_empty, post_json, test_state};
use serde_json::json;
use tandem_core::types::new_id;

#[tokio::test]
async fn beacons_close_an_open_session_and_are_idempotent() {
    let app = build_test_app(test_state());
    let user_id = new_id();
    let created = post_json(
        app.clone(),
        "/api/v1/sessions",
        json!({ "user_id": user_id, "duration_minutes": 25, "mode": "solo" }),
    )
    .await;
    let id = body_json(created).await["data"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    for _ in 0..2 {
        let abandon = post_empty(app.clone(), &format!("/api/v1/beacon/sessions/{id}/abandon")).await;
        assert_eq!(abandon.status(), StatusCode::ACCEPTED);
        let leave = post_empty(
            app.clone(),
            &format!("/api/v1/beacon/sessions/{id}/participants/{user_id}/leave"),
        )
        .await;
        assert_eq!(leave.status(), StatusCode::ACCEPTED);
    }

    let session = body_json(get(app.clone(), &format!("/api/v1/sessions/{id}")).await).await;
    assert_eq!(session["data"]["status"], "abandoned");
    let participants = body_json(get(app, &format!("/api/v1/sessions/{id}/participants")).await).await;
    assert_eq!(participants["data"][0]["status"], "left_early");
}
