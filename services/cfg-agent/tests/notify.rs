//! Integration tests for the notification API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use hdcfg_agent::notify;
use tower::ServiceExt;

fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let h = Harness::new();
    let app = notify::routes(h.scheduler.clone());

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_routers_updated_queues_work() {
    let h = Harness::new();
    let device = device();
    let spec = router_on(&device);
    h.controller.upsert(spec.clone());

    let response = notify::routes(h.scheduler.clone())
        .oneshot(post(
            "/v1/notifications/routers-updated",
            serde_json::json!({ "routers": [spec.id] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    h.scheduler.run_incremental_pass().await.unwrap();
    assert_eq!(h.router_ids().await, vec![spec.id]);
}

#[tokio::test]
async fn test_router_deleted_removes_router() {
    let h = Harness::new();
    let spec = router_on(&device());
    h.controller.upsert(spec.clone());
    h.scheduler.run_full_sync().await.unwrap();

    let response = notify::routes(h.scheduler.clone())
        .oneshot(post(
            "/v1/notifications/router-deleted",
            serde_json::json!({ "router_id": spec.id }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    h.scheduler.run_incremental_pass().await.unwrap();
    assert!(h.router_ids().await.is_empty());
    assert_eq!(h.log().calls_for(spec.id).last(), Some(&Call::RouterRemoved));
}

#[tokio::test]
async fn test_hosting_device_removed() {
    let h = Harness::new();
    let device = device();
    let spec = router_on(&device);
    h.controller.upsert(spec.clone());
    h.scheduler.run_full_sync().await.unwrap();
    h.log().clear();

    let body = serde_json::json!({
        "hosting_data": { device.id.to_string(): { "routers": [spec.id] } },
        "deconfigure": false
    });
    let response = notify::routes(h.scheduler.clone())
        .oneshot(post("/v1/notifications/hosting-device-removed", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    h.scheduler.run_incremental_pass().await.unwrap();
    assert!(h.router_ids().await.is_empty());
    assert!(h.log().calls().is_empty());
}

#[tokio::test]
async fn test_agent_updated_requests_full_sync() {
    let h = Harness::new();
    h.scheduler.run_full_sync().await.unwrap();
    assert!(!h.scheduler.needs_full_sync());

    let response = notify::routes(h.scheduler.clone())
        .oneshot(post(
            "/v1/notifications/agent-updated",
            serde_json::json!({ "admin_state_up": true }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(h.scheduler.needs_full_sync());
}

#[tokio::test]
async fn test_malformed_router_id_is_rejected() {
    let h = Harness::new();

    let response = notify::routes(h.scheduler.clone())
        .oneshot(post(
            "/v1/notifications/router-deleted",
            serde_json::json!({ "router_id": "not-a-uuid" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
