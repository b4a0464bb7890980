//! Hosting device liveness probes.
//!
//! A probe answers one question: does the device respond right now? It never
//! fails; errors and timeouts count as unreachable.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use crate::config::ProbeKind;
use crate::model::HostingDevice;

/// Checks whether a hosting device responds.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_alive(&self, device: &HostingDevice) -> bool;
}

/// Build the probe selected in configuration.
pub fn from_kind(kind: ProbeKind, timeout: Duration) -> Arc<dyn ReachabilityProbe> {
    match kind {
        ProbeKind::Ping => Arc::new(PingProbe::new(timeout)),
        ProbeKind::Tcp => Arc::new(TcpProbe::new(timeout)),
    }
}

/// ICMP echo through the system `ping` binary: 5 packets, 0.2 s apart, 1 s wait each.
#[derive(Debug, Clone)]
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_alive(&self, device: &HostingDevice) -> bool {
        let address = device.management_ip.to_string();
        let binary = if device.management_ip.is_ipv6() {
            "ping6"
        } else {
            "ping"
        };

        let status = Command::new(binary)
            .args(["-c", "5", "-W", "1", "-i", "0.2", &address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Failed to run ping");
                false
            }
            Err(_) => {
                debug!(address = %address, timeout = ?self.timeout, "Ping timed out");
                false
            }
        }
    }
}

/// TCP connect to the management port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_alive(&self, device: &HostingDevice) -> bool {
        let address = SocketAddr::new(device.management_ip, device.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "Management port refused connection");
                false
            }
            Err(_) => {
                debug!(address = %address, timeout = ?self.timeout, "Management port timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hdcfg_id::HostingDeviceId;
    use tokio::net::TcpListener;

    fn device_at(address: SocketAddr) -> HostingDevice {
        HostingDevice {
            id: HostingDeviceId::new(),
            family: "CSR1kv".to_string(),
            management_ip: address.ip(),
            port: address.port(),
            created_at: Utc::now(),
            booting_time_secs: 0,
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let device = device_at(listener.local_addr().unwrap());

        let probe = TcpProbe::new(Duration::from_secs(1));
        assert!(probe.is_alive(&device).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProbe::new(Duration::from_secs(1));
        assert!(!probe.is_alive(&device_at(address)).await);
    }
}
