//! Configuration drivers.
//!
//! A driver turns the router model into configuration on one hosting device.
//! Every operation must be safe to repeat: a pass that failed halfway is
//! simply rerun, so drivers check the running configuration before pushing
//! anything the device would reject as a duplicate.
//!
//! Drivers are selected per device family through a [`DriverCatalog`].

pub mod csr;
pub mod running_config;
pub mod session;
pub mod snippets;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hdcfg_id::RouterId;
use hdcfg_reconcile::RouteAction;

use crate::error::DriverError;
use crate::model::{HostingDevice, RouteSpec};
use crate::router::{BoundPort, FloatingIp};

/// Idempotent configuration operations against one hosting device.
#[async_trait]
pub trait RoutingDriver: Send + Sync {
    /// Create the router's VRF.
    async fn router_added(&self, router_id: &RouterId) -> Result<(), DriverError>;

    /// Remove the router's VRF.
    async fn router_removed(&self, router_id: &RouterId) -> Result<(), DriverError>;

    /// Create the subinterface for an internal port.
    async fn internal_network_added(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Remove the subinterface of an internal port.
    async fn internal_network_removed(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Create the gateway subinterface and the default route through it.
    async fn external_gateway_added(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Remove the default route and the gateway subinterface.
    async fn external_gateway_removed(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Source-NAT the internal port's subnet behind the gateway.
    async fn enable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        gateway: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Undo [`RoutingDriver::enable_internal_network_nat`].
    async fn disable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        gateway: &BoundPort,
    ) -> Result<(), DriverError>;

    /// Install a 1:1 NAT mapping.
    async fn floating_ip_added(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError>;

    /// Remove a 1:1 NAT mapping.
    async fn floating_ip_removed(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError>;

    /// Upsert or delete a static route in the router's VRF.
    async fn routes_updated(
        &self,
        router_id: &RouterId,
        action: RouteAction,
        route: &RouteSpec,
    ) -> Result<(), DriverError>;

    /// Drop the management session; the next operation reconnects.
    async fn clear_connection(&self);
}

/// Builds drivers for one device family.
pub trait DriverFactory: Send + Sync {
    fn create(&self, device: &HostingDevice) -> Result<Arc<dyn RoutingDriver>, DriverError>;
}

/// Driver factories keyed by device family tag.
#[derive(Clone, Default)]
pub struct DriverCatalog {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a family tag, replacing any previous one.
    pub fn register(&mut self, family: impl Into<String>, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(family.into(), factory);
    }

    pub fn with(mut self, family: impl Into<String>, factory: Arc<dyn DriverFactory>) -> Self {
        self.register(family, factory);
        self
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create a driver for a device using the factory of its family.
    pub fn create(&self, device: &HostingDevice) -> Result<Arc<dyn RoutingDriver>, DriverError> {
        let factory = self
            .factories
            .get(&device.family)
            .ok_or_else(|| DriverError::UnsupportedFamily(device.family.clone()))?;
        factory.create(device)
    }
}

impl std::fmt::Debug for DriverCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut families: Vec<&str> = self.families().collect();
        families.sort_unstable();
        f.debug_struct("DriverCatalog")
            .field("families", &families)
            .finish()
    }
}
