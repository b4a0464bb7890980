//! Controller API client.
//!
//! The agent pulls router specs from the controller and pushes back dead
//! hosting devices and a periodic state report. All calls are JSON over HTTP
//! under `/v1/agents/{host}`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hdcfg_id::{HostingDeviceId, NetworkId, RouterId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::Config;
use crate::error::ControllerError;
use crate::model::RouterSpec;

/// Error code the controller uses when it cannot pick one external network.
pub const TOO_MANY_EXTERNAL_NETWORKS: &str = "too_many_external_networks";

/// The controller operations the agent depends on.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Router specs for this agent. Both filters empty means every router.
    async fn get_routers(
        &self,
        router_ids: &[RouterId],
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<Vec<RouterSpec>, ControllerError>;

    /// The single external network routers should attach to, if any.
    async fn get_external_network_id(&self) -> Result<Option<NetworkId>, ControllerError>;

    async fn report_dead_hosting_devices(
        &self,
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<(), ControllerError>;

    async fn report_state(&self, report: &AgentStateReport) -> Result<(), ControllerError>;
}

/// Body of `routers:sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRoutersRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub router_ids: Vec<RouterId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosting_device_ids: Vec<HostingDeviceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalNetworkResponse {
    pub network_id: Option<NetworkId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDeadRequest {
    pub hosting_device_ids: Vec<HostingDeviceId>,
}

/// Periodic agent state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateReport {
    pub host: String,
    pub routers: usize,
    pub ex_gw_ports: usize,
    pub interfaces: usize,
    pub floating_ips: usize,

    /// Router count per hosting device.
    pub hosting_devices: BTreeMap<HostingDeviceId, usize>,

    /// Backlogged devices and the routers waiting on them.
    pub non_responding_hosting_devices: BTreeMap<HostingDeviceId, Vec<RouterId>>,

    /// Set on the first report after startup.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub start_flag: bool,
}

/// Error body returned by the controller.
#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
}

/// HTTP implementation of [`Controller`].
pub struct HttpController {
    client: reqwest::Client,
    base_url: String,
    host: String,
}

impl HttpController {
    pub fn new(config: &Config) -> Result<Self, ControllerError> {
        Self::with_base_url(&config.controller_url, &config.host)
    }

    pub fn with_base_url(base_url: &str, host: &str) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host: host.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/agents/{}/{}", self.base_url, self.host, path)
    }

    async fn check(
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, ControllerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Failed to {}", what);
        Err(ControllerError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Controller for HttpController {
    async fn get_routers(
        &self,
        router_ids: &[RouterId],
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<Vec<RouterSpec>, ControllerError> {
        let url = self.url("routers:sync");
        let request = SyncRoutersRequest {
            router_ids: router_ids.to_vec(),
            hosting_device_ids: hosting_device_ids.to_vec(),
        };
        debug!(
            url = %url,
            router_count = router_ids.len(),
            hosting_device_count = hosting_device_ids.len(),
            "Fetching routers"
        );

        let response = self.client.post(&url).json(&request).send().await?;
        let response = Self::check(response, "fetch routers").await?;

        let routers: Vec<RouterSpec> = response.json().await?;
        debug!(router_count = routers.len(), "Fetched routers");
        Ok(routers)
    }

    async fn get_external_network_id(&self) -> Result<Option<NetworkId>, ControllerError> {
        let url = self.url("external-network");
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            let code = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.code);
            if code.as_deref() == Some(TOO_MANY_EXTERNAL_NETWORKS) {
                return Err(ControllerError::TooManyExternalNetworks);
            }
            return Err(ControllerError::Status { status: 409, body });
        }

        let response = Self::check(response, "fetch external network").await?;
        let payload: ExternalNetworkResponse = response.json().await?;
        Ok(payload.network_id)
    }

    async fn report_dead_hosting_devices(
        &self,
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<(), ControllerError> {
        if hosting_device_ids.is_empty() {
            return Ok(());
        }

        let url = self.url("hosting-devices:report-dead");
        let request = ReportDeadRequest {
            hosting_device_ids: hosting_device_ids.to_vec(),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        Self::check(response, "report dead hosting devices").await?;
        Ok(())
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<(), ControllerError> {
        let url = self.url("state");
        let response = self
            .client
            .post(&url)
            .json(report)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::NOT_IMPLEMENTED => {
                Err(ControllerError::NotSupported("state reports"))
            }
            _ => {
                Self::check(response, "report state").await?;
                Ok(())
            }
        }
    }
}
