use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::util::ServiceExt;

use cadenza::core::session::SessionMode;
use cadenza::{ServerConfig, routes, state::AppState};

fn test_state() -> Arc<AppState> {
    AppState::new(ServerConfig::default())
}

fn app(state: Arc<AppState>) -> Router {
    routes::api::create_api_router().with_state(state)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Start a segmented session and put both parties in the voice channel.
async fn seeded_state() -> Arc<AppState> {
    let state = test_state();
    state
        .sessions
        .start(1, 10, 11, SessionMode::SegmentedPipeline)
        .await
        .unwrap();
    state.sessions.apply_participant_change(1, 100, true).unwrap();
    state.sessions.apply_participant_change(1, 200, true).unwrap();
    state
}

fn grant_body() -> Value {
    json!({
        "guild_id": "1",
        "channel_id": "10",
        "requester_id": "100",
        "target_id": "200",
    })
}

#[tokio::test]
async fn test_health_check() {
    let response = app(test_state())
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "OK");
}

#[tokio::test]
async fn test_sessions_listing_reflects_live_sessions() {
    let state = seeded_state().await;
    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["guild_id"], "1");
    assert_eq!(json["sessions"][0]["participant_count"], 2);
    assert_eq!(json["sessions"][0]["bot_state"], "idle");
}

#[tokio::test]
async fn test_grant_succeeds_for_present_parties() {
    let state = seeded_state().await;
    let response = app(state)
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["token"].as_str().unwrap().len() >= 64);
    assert_eq!(json["expires_in_minutes"], 12);
}

#[tokio::test]
async fn test_grant_clamps_oversized_ttl() {
    let state = seeded_state().await;
    let mut body = grant_body();
    body["ttl_minutes"] = json!(u64::MAX);

    let response = app(state)
        .oneshot(post_json("/capability/grant", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["expires_in_minutes"], 30);
}

#[tokio::test]
async fn test_grant_rejects_absent_target_with_reason() {
    let state = seeded_state().await;
    state.sessions.apply_participant_change(1, 200, false).unwrap();

    let response = app(state)
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["reason"], "target_not_present");
    assert!(json["error"].as_str().is_some());
}

#[tokio::test]
async fn test_grant_rejects_malformed_snowflake() {
    let state = seeded_state().await;
    let mut body = grant_body();
    body["guild_id"] = json!("not-a-number");

    let response = app(state)
        .oneshot(post_json("/capability/grant", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_frame_flow_accepts_after_grant() {
    let state = seeded_state().await;
    let router = app(state);

    let grant = router
        .clone()
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();
    let token = body_json(grant).await["token"].as_str().unwrap().to_string();

    let response = router
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": token,
                "mime_type": "audio/ogg",
                "data_base64": BASE64.encode(b"frame-bytes"),
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["accepted"], true);
    assert_eq!(json["reason"], Value::Null);
}

#[tokio::test]
async fn test_frame_with_unknown_token_is_rejected() {
    let response = app(test_state())
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": "deadbeef",
                "mime_type": "audio/ogg",
                "data_base64": BASE64.encode(b"x"),
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["accepted"], false);
    assert_eq!(json["reason"], "unknown_token");
}

#[tokio::test]
async fn test_frame_with_invalid_base64_is_a_bad_request() {
    let response = app(test_state())
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": "irrelevant",
                "mime_type": "audio/ogg",
                "data_base64": "@@not-base64@@",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_frame_rejected_when_requester_leaves_after_grant() {
    let state = seeded_state().await;
    let router = app(state.clone());

    let grant = router
        .clone()
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();
    let token = body_json(grant).await["token"].as_str().unwrap().to_string();

    state.sessions.apply_participant_change(1, 100, false).unwrap();

    let response = router
        .clone()
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": token.clone(),
                "mime_type": "audio/ogg",
                "data_base64": BASE64.encode(b"x"),
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["reason"], "requester_not_present");

    // The token was revoked, not merely refused: a retry after the
    // requester rejoins sees an unknown token
    state.sessions.apply_participant_change(1, 100, true).unwrap();
    let retry = router
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": token,
                "mime_type": "audio/ogg",
                "data_base64": BASE64.encode(b"x"),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_stop_revokes_token() {
    let state = seeded_state().await;
    let router = app(state);

    let grant = router
        .clone()
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();
    let token = body_json(grant).await["token"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(post_json(
            "/capability/stop",
            json!({ "token": token.clone(), "reason": "screen_share_ended" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["revoked"], true);

    // Idempotent: second stop reports nothing to revoke
    let again = router
        .oneshot(post_json("/capability/stop", json!({ "token": token })))
        .await
        .unwrap();
    assert_eq!(body_json(again).await["revoked"], false);
}

#[tokio::test]
async fn test_session_end_revokes_guild_tokens() {
    let state = seeded_state().await;
    let router = app(state.clone());

    let grant = router
        .clone()
        .oneshot(post_json("/capability/grant", grant_body()))
        .await
        .unwrap();
    let token = body_json(grant).await["token"].as_str().unwrap().to_string();

    state
        .sessions
        .end(1, cadenza::core::session::EndReason::ExplicitLeave)
        .await
        .unwrap();

    let response = router
        .oneshot(post_json(
            "/capability/frame",
            json!({
                "token": token,
                "mime_type": "audio/ogg",
                "data_base64": BASE64.encode(b"x"),
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["reason"], "unknown_token");
}
