//! Error types for the cfg agent.

use std::time::Duration;

use hdcfg_id::{FloatingIpId, HostingDeviceId, PortId, RouterId};
use hdcfg_networking::NetworkError;
use thiserror::Error;

// =============================================================================
// Driver errors
// =============================================================================

/// Errors raised by a configuration driver or its management session.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The device answered a push without the success marker.
    #[error("{snippet} rejected by device (type: {error_type}, tag: {error_tag})")]
    PushFailed {
        snippet: &'static str,
        error_type: String,
        error_tag: String,
    },

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("management session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The device sent something that is not a well-formed reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no driver registered for device family '{0}'")]
    UnsupportedFamily(String),

    /// Port metadata cannot be mapped onto a device interface.
    #[error("port {port_id} cannot be mapped to an interface: {source}")]
    InvalidPort {
        port_id: PortId,
        #[source]
        source: NetworkError,
    },

    #[error(transparent)]
    Network(#[from] NetworkError),
}

// =============================================================================
// Reconciliation errors
// =============================================================================

/// Errors that abort one router's reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("malformed port {port_id}: {reason}")]
    MalformedPort { port_id: PortId, reason: String },

    #[error("malformed floating ip {id}: {source}")]
    MalformedFloatingIp {
        id: FloatingIpId,
        #[source]
        source: NetworkError,
    },

    #[error("{operation} failed: {source}")]
    Driver {
        operation: &'static str,
        #[source]
        source: DriverError,
    },
}

impl ReconcileError {
    pub(crate) fn driver(operation: &'static str) -> impl FnOnce(DriverError) -> Self {
        move |source| ReconcileError::Driver { operation, source }
    }

    pub(crate) fn malformed_port(port_id: PortId, reason: impl Into<String>) -> Self {
        ReconcileError::MalformedPort {
            port_id,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Registry errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("hosting device {0} is backlogged")]
    Backlogged(HostingDeviceId),

    #[error("failed to create driver for hosting device {device_id}: {source}")]
    DriverCreation {
        device_id: HostingDeviceId,
        #[source]
        source: DriverError,
    },
}

// =============================================================================
// Controller errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("controller returned {status}: {body}")]
    Status { status: u16, body: String },

    /// More than one external network exists and none was configured.
    #[error("controller has more than one external network")]
    TooManyExternalNetworks,

    /// The controller does not implement the called endpoint.
    #[error("controller does not support {0}")]
    NotSupported(&'static str),
}

// =============================================================================
// Agent errors
// =============================================================================

/// Errors surfaced by a sync batch.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("router {router_id}: {source}")]
    Reconcile {
        router_id: RouterId,
        #[source]
        source: ReconcileError,
    },

    #[error("router {router_id}: {source}")]
    Registry {
        router_id: RouterId,
        #[source]
        source: RegistryError,
    },

    /// One or more routers in the batch failed; details were logged per router.
    #[error("{failed} of {total} routers failed to reconcile")]
    Batch { failed: usize, total: usize },
}
