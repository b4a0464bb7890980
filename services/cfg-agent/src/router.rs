//! Per-router state: what the controller wants versus what the device has.
//!
//! A [`RouterState`] is created the first time a router shows up in a sync
//! response and lives until the router is deleted or its hosting device is
//! removed with deconfiguration. Its applied fields only ever move when a
//! push has been acknowledged by the device, which is what makes a
//! reconciliation pass safe to rerun after a failure.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use hdcfg_id::{FloatingIpId, HostingDeviceId, PortId, RouterId};
use hdcfg_networking::{parse_ipv4, InterfaceAddress};
use tracing::warn;

use crate::error::ReconcileError;
use crate::model::{
    FloatingIpSpec, HaKind, HostingDevice, HostingInfo, PortHaInfo, PortSpec, RouteSpec,
    RouterHaInfo, RouterSpec,
};

/// One first-hop redundancy group on an internal port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaGroup {
    pub group: u32,
    pub priority: u32,
    pub virtual_ip: Ipv4Addr,
}

/// Redundancy protocol an internal port runs, with its group settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaMode {
    Hsrp(HaGroup),
    Vrrp(HaGroup),
    Glbp(HaGroup),
}

impl HaMode {
    /// Combine the router's and the port's redundancy settings.
    ///
    /// Yields `None` unless HA is enabled on the router and the group,
    /// priority and virtual address are all known.
    fn resolve(
        port_id: PortId,
        router: Option<&RouterHaInfo>,
        port: Option<&PortHaInfo>,
    ) -> Result<Option<Self>, ReconcileError> {
        let (Some(router), Some(port)) = (router.filter(|ha| ha.enabled), port) else {
            return Ok(None);
        };
        let virtual_ip = port
            .virtual_port
            .as_ref()
            .and_then(|vport| vport.fixed_ips.first())
            .map(|ip| ip.ip_address.as_str());

        let (Some(group), Some(priority), Some(virtual_ip)) =
            (port.group, router.priority, virtual_ip)
        else {
            warn!(port_id = %port_id, "Incomplete HA settings, port configured without HA");
            return Ok(None);
        };
        let virtual_ip = parse_ipv4(virtual_ip)
            .map_err(|e| ReconcileError::malformed_port(port_id, e.to_string()))?;

        let group = HaGroup {
            group,
            priority,
            virtual_ip,
        };
        Ok(Some(match router.kind {
            HaKind::Hsrp => HaMode::Hsrp(group),
            HaKind::Vrrp => HaMode::Vrrp(group),
            HaKind::Glbp => HaMode::Glbp(group),
        }))
    }
}

/// A router port validated for pushing to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPort {
    pub id: PortId,

    /// Interface address with the subnet's prefix length.
    pub address: InterfaceAddress,

    /// Gateway of the port's subnet, used for the default route on gateway ports.
    pub subnet_gateway: Option<Ipv4Addr>,

    pub hosting: HostingInfo,

    /// Set on internal ports of HA-enabled routers only.
    pub ha: Option<HaMode>,
}

impl BoundPort {
    /// Validate a port from the controller.
    ///
    /// Exactly one fixed IP is expected. With none the port cannot be
    /// configured; with more than one the first is used.
    pub fn bind(spec: &PortSpec) -> Result<Self, ReconcileError> {
        let fixed_ip = match spec.fixed_ips.as_slice() {
            [] => {
                return Err(ReconcileError::malformed_port(spec.id, "port has no fixed IP"));
            }
            [only] => only,
            [first, ..] => {
                warn!(
                    port_id = %spec.id,
                    count = spec.fixed_ips.len(),
                    ip_address = %first.ip_address,
                    "Port has multiple fixed IPs, using the first"
                );
                first
            }
        };

        let subnet = spec
            .subnet
            .as_ref()
            .ok_or_else(|| ReconcileError::malformed_port(spec.id, "port has no subnet"))?;

        let hosting = spec
            .hosting_info
            .clone()
            .ok_or_else(|| ReconcileError::malformed_port(spec.id, "port has no hosting info"))?;

        let address = InterfaceAddress::from_subnet(&fixed_ip.ip_address, &subnet.cidr)
            .map_err(|e| ReconcileError::malformed_port(spec.id, e.to_string()))?;

        let subnet_gateway = subnet
            .gateway_ip
            .as_deref()
            .filter(|gw| !gw.trim().is_empty())
            .map(parse_ipv4)
            .transpose()
            .map_err(|e| ReconcileError::malformed_port(spec.id, e.to_string()))?;

        Ok(Self {
            id: spec.id,
            address,
            subnet_gateway,
            hosting,
            ha: None,
        })
    }

    /// Validate an internal port of a router with redundancy settings `ha`.
    pub fn bind_internal(
        spec: &PortSpec,
        ha: Option<&RouterHaInfo>,
    ) -> Result<Self, ReconcileError> {
        let mut port = Self::bind(spec)?;
        port.ha = HaMode::resolve(spec.id, ha, spec.ha_info.as_ref())?;
        Ok(port)
    }
}

/// A floating IP associated with a fixed address behind the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloatingIp {
    pub id: FloatingIpId,
    pub floating: Ipv4Addr,
    pub fixed: Ipv4Addr,
}

impl FloatingIp {
    /// Validate a floating IP. Unassociated entries yield `None`.
    pub fn bind(spec: &FloatingIpSpec) -> Result<Option<Self>, ReconcileError> {
        let fixed = match (&spec.port_id, spec.fixed_ip_address.as_deref()) {
            (Some(_), Some(fixed)) if !fixed.trim().is_empty() => fixed,
            _ => return Ok(None),
        };

        let malformed = |source| ReconcileError::MalformedFloatingIp {
            id: spec.id,
            source,
        };

        Ok(Some(Self {
            id: spec.id,
            floating: parse_ipv4(&spec.floating_ip_address).map_err(malformed)?,
            fixed: parse_ipv4(fixed).map_err(malformed)?,
        }))
    }
}

/// NAT change an internal port is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnatAction {
    Enable,
    Disable,
}

/// Desired and applied state of one router.
#[derive(Debug, Clone)]
pub struct RouterState {
    pub(crate) id: RouterId,
    pub(crate) desired: RouterSpec,

    pub(crate) internal_ports: Vec<BoundPort>,
    pub(crate) gateway: Option<BoundPort>,
    pub(crate) floating_ips: Vec<FloatingIp>,
    pub(crate) routes: Vec<RouteSpec>,

    /// Internal ports that currently have source NAT bound to the gateway.
    pub(crate) nat_ports: BTreeSet<PortId>,
}

impl RouterState {
    /// Fresh state for a router nothing has been pushed for yet.
    pub fn new(desired: RouterSpec) -> Self {
        Self {
            id: desired.id,
            desired,
            internal_ports: Vec::new(),
            gateway: None,
            floating_ips: Vec::new(),
            routes: Vec::new(),
            nat_ports: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    pub fn desired(&self) -> &RouterSpec {
        &self.desired
    }

    /// Replace the desired spec with a newer one from the controller.
    pub fn update_desired(&mut self, desired: RouterSpec) {
        debug_assert_eq!(desired.id, self.id);
        self.desired = desired;
    }

    /// Empty the desired sub-resources so the next pass tears everything down.
    ///
    /// The hosting device binding is kept; the teardown still needs a driver.
    pub fn mark_for_teardown(&mut self) {
        self.desired.gw_port = None;
        self.desired.external_gateway_info = None;
        self.desired.interfaces.clear();
        self.desired.floating_ips.clear();
        self.desired.routes.clear();
    }

    pub fn hosting_device(&self) -> Option<&HostingDevice> {
        self.desired.hosting_device.as_ref()
    }

    pub fn hosting_device_id(&self) -> Option<HostingDeviceId> {
        self.hosting_device().map(|d| d.id)
    }

    pub fn internal_ports(&self) -> &[BoundPort] {
        &self.internal_ports
    }

    pub fn gateway(&self) -> Option<&BoundPort> {
        self.gateway.as_ref()
    }

    pub fn floating_ips(&self) -> &[FloatingIp] {
        &self.floating_ips
    }

    pub fn routes(&self) -> &[RouteSpec] {
        &self.routes
    }

    /// True when source NAT is bound for the given internal port.
    pub fn has_nat(&self, port_id: &PortId) -> bool {
        self.nat_ports.contains(port_id)
    }

    /// Whether internal ports should be source-NATed behind the applied gateway.
    pub(crate) fn wants_nat(&self) -> bool {
        self.gateway.is_some() && self.desired.enable_snat
    }

    /// NAT changes the applied internal ports still need.
    pub fn pending_snat_actions(&self) -> Vec<(PortId, SnatAction)> {
        let wants_nat = self.wants_nat();
        self.internal_ports
            .iter()
            .filter_map(|port| match (wants_nat, self.nat_ports.contains(&port.id)) {
                (true, false) => Some((port.id, SnatAction::Enable)),
                (false, true) => Some((port.id, SnatAction::Disable)),
                _ => None,
            })
            .collect()
    }

    /// True when nothing is configured on the device for this router.
    pub fn is_deconfigured(&self) -> bool {
        self.internal_ports.is_empty()
            && self.gateway.is_none()
            && self.floating_ips.is_empty()
            && self.routes.is_empty()
            && self.nat_ports.is_empty()
    }
}
