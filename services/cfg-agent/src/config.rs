//! Configuration for the cfg agent.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hdcfg_id::{NetworkId, RouterId};

/// Default period of the incremental sync loop.
pub const DEFAULT_RPC_LOOP_INTERVAL_SECS: u64 = 1;

/// Default period of the full resync task.
pub const DEFAULT_FULL_SYNC_INTERVAL_SECS: u64 = 40;

/// Default heartbeat period.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 30;

/// Default time a backlogged device may stay unreachable before it is declared dead.
pub const DEFAULT_DEAD_TIMEOUT_SECS: u64 = 300;

/// Default upper bound on routers reconciled in parallel.
pub const DEFAULT_MAX_CONCURRENT_ROUTERS: usize = 8;

/// How device liveness is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// ICMP echo via the system `ping` binary.
    Ping,
    /// TCP connect to the device's management port.
    Tcp,
}

impl std::str::FromStr for ProbeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" | "icmp" => Ok(Self::Ping),
            "tcp" => Ok(Self::Tcp),
            other => bail!("unknown probe kind '{}', expected 'ping' or 'tcp'", other),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host name this agent reports as.
    pub host: String,

    /// Controller API URL.
    pub controller_url: String,

    /// Listen address for controller notifications.
    pub notify_listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Period of the incremental sync loop.
    pub rpc_loop_interval: Duration,

    /// Period of the full resync task.
    pub full_sync_interval: Duration,

    /// Heartbeat period, `None` disables state reports.
    pub report_interval: Option<Duration>,

    /// How long a backlogged device may stay unreachable before it is declared dead.
    pub hosting_device_dead_timeout: Duration,

    /// Upper bound on routers reconciled in parallel within one batch.
    pub max_concurrent_routers: usize,

    /// Restrict the agent to a single router.
    pub router_id: Option<RouterId>,

    /// Also handle routers that have no external gateway network.
    pub handle_internal_only_routers: bool,

    /// External network this agent serves. Looked up from the controller when unset.
    pub gateway_external_network_id: Option<NetworkId>,

    /// External bridge name. Without one, routers on any external network are handled.
    pub external_network_bridge: Option<String>,

    /// Liveness probe implementation.
    pub probe: ProbeKind,

    /// Timeout of a single liveness probe.
    pub probe_timeout: Duration,

    /// Timeout for establishing a management session.
    pub connect_timeout: Duration,

    /// Timeout for a single configuration push.
    pub push_timeout: Duration,

    /// Delay between disabling inside NAT and clearing translations.
    pub nat_settle: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("HDCFG_HOST")
            .or_else(|| var("HOSTNAME"))
            .unwrap_or_else(|| "cfg-agent".to_string());

        let controller_url = var("HDCFG_CONTROLLER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:9696".to_string());

        let notify_listen_addr = var("HDCFG_NOTIFY_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8090".to_string())
            .parse()
            .context("HDCFG_NOTIFY_LISTEN_ADDR is not a socket address")?;

        let log_level = var("HDCFG_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let secs = |name: &str, default: u64| -> Result<u64> {
            match var(name) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be a number of seconds", name)),
                None => Ok(default),
            }
        };

        let rpc_loop_interval =
            Duration::from_secs(secs("HDCFG_RPC_LOOP_INTERVAL", DEFAULT_RPC_LOOP_INTERVAL_SECS)?);
        let full_sync_interval = Duration::from_secs(secs(
            "HDCFG_FULL_SYNC_INTERVAL",
            DEFAULT_FULL_SYNC_INTERVAL_SECS,
        )?);
        let report_interval = match secs("HDCFG_REPORT_INTERVAL", DEFAULT_REPORT_INTERVAL_SECS)? {
            0 => None,
            n => Some(Duration::from_secs(n)),
        };
        let hosting_device_dead_timeout = Duration::from_secs(secs(
            "HDCFG_HOSTING_DEVICE_DEAD_TIMEOUT",
            DEFAULT_DEAD_TIMEOUT_SECS,
        )?);

        let max_concurrent_routers = match var("HDCFG_MAX_CONCURRENT_ROUTERS") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .context("HDCFG_MAX_CONCURRENT_ROUTERS must be a positive integer")?
                .max(1),
            None => DEFAULT_MAX_CONCURRENT_ROUTERS,
        };

        let router_id = var("HDCFG_ROUTER_ID")
            .map(|v| RouterId::parse(&v))
            .transpose()
            .context("HDCFG_ROUTER_ID")?;

        let handle_internal_only_routers = match var("HDCFG_HANDLE_INTERNAL_ONLY_ROUTERS") {
            Some(v) => parse_bool(&v).context("HDCFG_HANDLE_INTERNAL_ONLY_ROUTERS")?,
            None => true,
        };

        let gateway_external_network_id = var("HDCFG_GATEWAY_EXTERNAL_NETWORK_ID")
            .map(|v| NetworkId::parse(&v))
            .transpose()
            .context("HDCFG_GATEWAY_EXTERNAL_NETWORK_ID")?;

        let external_network_bridge = var("HDCFG_EXTERNAL_NETWORK_BRIDGE");

        let probe = match var("HDCFG_PROBE") {
            Some(v) => v.parse()?,
            None => ProbeKind::Ping,
        };

        let probe_timeout = Duration::from_secs(secs("HDCFG_PROBE_TIMEOUT", 5)?);
        let connect_timeout = Duration::from_secs(secs("HDCFG_CONNECT_TIMEOUT", 10)?);
        let push_timeout = Duration::from_secs(secs("HDCFG_PUSH_TIMEOUT", 30)?);
        let nat_settle = Duration::from_secs(secs("HDCFG_NAT_SETTLE", 2)?);

        Ok(Self {
            host,
            controller_url,
            notify_listen_addr,
            log_level,
            rpc_loop_interval,
            full_sync_interval,
            report_interval,
            hosting_device_dead_timeout,
            max_concurrent_routers,
            router_id,
            handle_internal_only_routers,
            gateway_external_network_id,
            external_network_bridge,
            probe,
            probe_timeout,
            connect_timeout,
            push_timeout,
            nat_settle,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("'{}' is not a boolean", other),
    }
}
