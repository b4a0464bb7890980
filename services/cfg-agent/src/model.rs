//! Router model as served by the controller's sync API.
//!
//! These types mirror the wire format. Addresses stay as strings here so that
//! one malformed router cannot fail deserialization of a whole batch; they are
//! validated when a port or floating IP is bound for pushing.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdcfg_id::{FloatingIpId, HostingDeviceId, NetworkId, PortId, RouterId, SubnetId};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Desired state of one router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub id: RouterId,

    #[serde(default = "default_true")]
    pub admin_state_up: bool,

    #[serde(default)]
    pub external_gateway_info: Option<ExternalGatewayInfo>,

    #[serde(default)]
    pub gw_port: Option<PortSpec>,

    #[serde(default, rename = "_interfaces")]
    pub interfaces: Vec<PortSpec>,

    #[serde(default, rename = "_floatingips")]
    pub floating_ips: Vec<FloatingIpSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    #[serde(default)]
    pub hosting_device: Option<HostingDevice>,

    #[serde(default = "default_true")]
    pub enable_snat: bool,

    /// First-hop redundancy shared by the router's internal ports.
    #[serde(default)]
    pub ha_info: Option<RouterHaInfo>,
}

impl RouterSpec {
    /// Minimal spec: admin up, no ports, no gateway.
    pub fn new(id: RouterId) -> Self {
        Self {
            id,
            admin_state_up: true,
            external_gateway_info: None,
            gw_port: None,
            interfaces: Vec::new(),
            floating_ips: Vec::new(),
            routes: Vec::new(),
            hosting_device: None,
            enable_snat: true,
            ha_info: None,
        }
    }

    /// External network the router's gateway sits on, if any.
    pub fn external_network_id(&self) -> Option<NetworkId> {
        self.external_gateway_info
            .as_ref()
            .and_then(|info| info.network_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalGatewayInfo {
    #[serde(default)]
    pub network_id: Option<NetworkId>,
}

/// A router port, internal or gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub id: PortId,

    #[serde(default = "default_true")]
    pub admin_state_up: bool,

    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,

    #[serde(default)]
    pub subnet: Option<SubnetInfo>,

    #[serde(default)]
    pub hosting_info: Option<HostingInfo>,

    #[serde(default)]
    pub ha_info: Option<PortHaInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedIp {
    pub ip_address: String,

    #[serde(default)]
    pub subnet_id: Option<SubnetId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub cidr: String,

    #[serde(default)]
    pub gateway_ip: Option<String>,
}

/// Where a port lands on its hosting device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostingInfo {
    pub segmentation_id: u32,
    pub hosting_port_name: String,
}

/// First-hop redundancy protocols a controller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaKind {
    #[serde(rename = "HSRP")]
    Hsrp,
    #[serde(rename = "VRRP")]
    Vrrp,
    #[serde(rename = "GLBP", alias = "GBLP")]
    Glbp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterHaInfo {
    #[serde(rename = "ha:enabled", default)]
    pub enabled: bool,

    #[serde(rename = "ha:type")]
    pub kind: HaKind,

    /// This router's priority within every redundancy group it joins.
    #[serde(default)]
    pub priority: Option<u32>,
}

/// Redundancy group a port belongs to, and the address the group shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortHaInfo {
    #[serde(default)]
    pub group: Option<u32>,

    #[serde(default)]
    pub virtual_port: Option<VirtualPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualPort {
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatingIpSpec {
    pub id: FloatingIpId,
    pub floating_ip_address: String,

    #[serde(default)]
    pub fixed_ip_address: Option<String>,

    #[serde(default)]
    pub port_id: Option<PortId>,
}

/// Static route in the router's VRF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub destination: String,
    pub nexthop: String,
}

/// Appliance a router is scheduled on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostingDevice {
    pub id: HostingDeviceId,

    /// Device family tag selecting the driver, e.g. `CSR1kv`.
    #[serde(rename = "host_type")]
    pub family: String,

    #[serde(rename = "ip_address")]
    pub management_ip: IpAddr,

    #[serde(default = "default_management_port")]
    pub port: u16,

    #[serde(with = "created_at_format")]
    pub created_at: DateTime<Utc>,

    /// Seconds the device needs after creation before it answers.
    #[serde(rename = "booting_time", default)]
    pub booting_time_secs: u64,
}

fn default_management_port() -> u16 {
    22
}

impl HostingDevice {
    pub fn boot_grace(&self) -> Duration {
        Duration::from_secs(self.booting_time_secs)
    }

    /// Instant the device is expected to have finished booting.
    pub fn booted_at(&self) -> DateTime<Utc> {
        i64::try_from(self.booting_time_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|grace| self.created_at.checked_add_signed(grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// `created_at` arrives either as a naive UTC `%Y-%m-%d %H:%M:%S` string or as RFC 3339.
mod created_at_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(NAIVE_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let raw = raw.trim();

        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT) {
            return Ok(naive.and_utc());
        }

        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| serde::de::Error::custom(format!("invalid created_at '{}': {}", raw, e)))
    }
}
