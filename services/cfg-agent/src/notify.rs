//! Inbound notification API.
//!
//! The controller pushes change notifications here. Handlers only queue work
//! on the scheduler and answer `202 Accepted`; reconciliation happens on the
//! next loop tick.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use chrono::Utc;
use hdcfg_id::{HostingDeviceId, RouterId};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::scheduler::SyncScheduler;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterNotification {
    pub router_id: RouterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutersNotification {
    pub routers: Vec<RouterId>,
}

/// Routers hosted on one removed device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostingData {
    #[serde(default)]
    pub routers: Vec<RouterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingDeviceRemovedNotification {
    pub hosting_data: BTreeMap<HostingDeviceId, HostingData>,

    #[serde(default)]
    pub deconfigure: bool,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

/// Notification and health routes.
pub fn routes(scheduler: Arc<SyncScheduler>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/notifications/router-deleted", post(router_deleted))
        .route("/v1/notifications/routers-updated", post(routers_updated))
        .route(
            "/v1/notifications/hosting-device-removed",
            post(hosting_device_removed),
        )
        .route(
            "/v1/notifications/router-removed-from-agent",
            post(router_removed_from_agent),
        )
        .route(
            "/v1/notifications/router-added-to-agent",
            post(router_added_to_agent),
        )
        .route("/v1/notifications/agent-updated", post(agent_updated))
        .layer(TraceLayer::new_for_http())
        .with_state(scheduler)
}

/// Serve the notification API until shutdown is signalled.
pub async fn serve(
    addr: SocketAddr,
    scheduler: Arc<SyncScheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Notification API listening");

    axum::serve(listener, routes(scheduler))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "cfg-agent".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn router_deleted(
    State(scheduler): State<Arc<SyncScheduler>>,
    Json(req): Json<RouterNotification>,
) -> StatusCode {
    scheduler.router_deleted(req.router_id);
    StatusCode::ACCEPTED
}

async fn routers_updated(
    State(scheduler): State<Arc<SyncScheduler>>,
    Json(req): Json<RoutersNotification>,
) -> StatusCode {
    scheduler.routers_updated(req.routers);
    StatusCode::ACCEPTED
}

async fn hosting_device_removed(
    State(scheduler): State<Arc<SyncScheduler>>,
    Json(req): Json<HostingDeviceRemovedNotification>,
) -> StatusCode {
    for (device_id, data) in req.hosting_data {
        scheduler.hosting_device_removed(device_id, data.routers, req.deconfigure);
    }
    StatusCode::ACCEPTED
}

async fn router_removed_from_agent(
    State(scheduler): State<Arc<SyncScheduler>>,
    Json(req): Json<RouterNotification>,
) -> StatusCode {
    scheduler.router_removed_from_agent(req.router_id);
    StatusCode::ACCEPTED
}

async fn router_added_to_agent(
    State(scheduler): State<Arc<SyncScheduler>>,
    Json(req): Json<RoutersNotification>,
) -> StatusCode {
    scheduler.router_added_to_agent(req.routers);
    StatusCode::ACCEPTED
}

async fn agent_updated(State(scheduler): State<Arc<SyncScheduler>>) -> StatusCode {
    scheduler.agent_updated();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hosting_device_removed_payload() {
        let device_id = HostingDeviceId::new();
        let router_id = RouterId::new();
        let body = serde_json::json!({
            "hosting_data": { device_id.to_string(): { "routers": [router_id] } },
            "deconfigure": true
        });

        let req: HostingDeviceRemovedNotification = serde_json::from_value(body).unwrap();
        assert!(req.deconfigure);
        assert_eq!(req.hosting_data[&device_id].routers, vec![router_id]);
    }

    #[test]
    fn test_deconfigure_defaults_to_false() {
        let body = serde_json::json!({ "hosting_data": {} });
        let req: HostingDeviceRemovedNotification = serde_json::from_value(body).unwrap();
        assert!(!req.deconfigure);
        assert!(req.hosting_data.is_empty());
    }
}
