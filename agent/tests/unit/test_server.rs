use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use deployd::server::serve::router;
use deployd::server::state::ServerState;
use ping_protocol::{OpCode, PingResponse};
use serde_json::Value;
use tokio_test::assert_ok;
use tower::ServiceExt;

use crate::common::{identity, Harness};

fn app(h: &Harness) -> Router {
    let state = ServerState::new(
        h.controller.machine().store().clone(),
        h.controller.clone(),
        identity(),
    );
    router(Arc::new(state))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_reports_identity() {
    let h = Harness::new();
    let (status, body) = get(app(&h), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "deployd");
    assert_eq!(body["host_id"], "host-1");
    assert_eq!(body["err_streak"], 0);
    assert!(body["last_cycle_at"].is_null());
}

#[tokio::test]
async fn test_envs_lists_records() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d1", Some(build))));
    assert_ok!(h.controller.run_cycle().await);

    let (status, body) = get(app(&h), "/envs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["envs"][0]["envName"], "web");
    assert_eq!(body["envs"][0]["currentStage"], "SERVING_BUILD");

    let (status, body) = get(app(&h), "/envs/web").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployId"], "d1");
    assert_eq!(body["status"], "SUCCEEDED");

    let (_, health) = get(app(&h), "/health").await;
    assert!(health["last_cycle_at"].is_string());
}

#[tokio::test]
async fn test_unknown_env_is_not_found() {
    let h = Harness::new();
    let (status, _) = get(app(&h), "/envs/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
