//! Driver for CSR1kv virtual routers.
//!
//! Each neutron router becomes a VRF named `nrouter-<id>` (truncated to the
//! IOS limit). Router ports become dot1Q subinterfaces on the trunk data
//! interfaces; NAT and static routes are scoped to the router's VRF.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hdcfg_id::RouterId;
use hdcfg_networking::{trunk_interface_number, validate_vlan, Ipv4Prefix};
use hdcfg_reconcile::RouteAction;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::running_config::RunningConfig;
use super::session::{check_reply, ManagementSession, SessionConnector, SessionTarget};
use super::snippets::{self, NatSide, Snippet};
use super::{DriverFactory, RoutingDriver};
use crate::error::DriverError;
use crate::model::{HostingDevice, RouteSpec};
use crate::router::{BoundPort, FloatingIp, HaMode};

/// Family tag of CSR1kv hosting devices.
pub const CSR1KV_FAMILY: &str = "CSR1kv";

/// IOS limit on VRF name length.
pub const VRF_NAME_LEN: usize = 14;

const VRF_PREFIX: &str = "nrouter-";

/// Data interfaces carrying the trunks.
const DATA_INTERFACES: [&str; 2] = ["GigabitEthernet2", "GigabitEthernet3"];

/// VRF name of a router.
pub fn vrf_name(router_id: &RouterId) -> String {
    let mut name = format!("{}{}", VRF_PREFIX, router_id);
    name.truncate(VRF_NAME_LEN);
    name
}

/// Subinterface name of a port, e.g. `GigabitEthernet2.101`.
pub fn interface_name(port: &BoundPort) -> Result<String, DriverError> {
    let invalid = |source| DriverError::InvalidPort {
        port_id: port.id,
        source,
    };
    let number = trunk_interface_number(&port.hosting.hosting_port_name).map_err(invalid)?;
    let vlan = validate_vlan(port.hosting.segmentation_id).map_err(invalid)?;
    Ok(format!("GigabitEthernet{}.{}", number, vlan))
}

fn vlan(port: &BoundPort) -> Result<u16, DriverError> {
    validate_vlan(port.hosting.segmentation_id).map_err(|source| DriverError::InvalidPort {
        port_id: port.id,
        source,
    })
}

fn acl_name(port: &BoundPort) -> Result<String, DriverError> {
    Ok(format!("acl_{}", vlan(port)?))
}

fn parse_route(route: &RouteSpec) -> Result<(Ipv4Prefix, Ipv4Addr), DriverError> {
    let destination = Ipv4Prefix::from_cidr(&route.destination)?;
    let nexthop = hdcfg_networking::parse_ipv4(&route.nexthop)?;
    Ok((destination, nexthop))
}

/// Settings shared by every CSR1kv driver.
#[derive(Debug, Clone, Copy)]
pub struct CsrSettings {
    pub connect_timeout: Duration,
    pub push_timeout: Duration,

    /// Pause between disabling inside NAT and clearing translations.
    pub nat_settle: Duration,
}

impl Default for CsrSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            push_timeout: Duration::from_secs(30),
            nat_settle: Duration::from_secs(2),
        }
    }
}

/// Creates [`CsrRoutingDriver`]s.
pub struct CsrDriverFactory {
    connector: Arc<dyn SessionConnector>,
    settings: CsrSettings,
}

impl CsrDriverFactory {
    pub fn new(connector: Arc<dyn SessionConnector>, settings: CsrSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }
}

impl DriverFactory for CsrDriverFactory {
    fn create(&self, device: &HostingDevice) -> Result<Arc<dyn RoutingDriver>, DriverError> {
        Ok(Arc::new(CsrRoutingDriver::new(
            device,
            self.connector.clone(),
            self.settings,
        )))
    }
}

type SessionSlot = Option<Box<dyn ManagementSession>>;

/// Routing driver for one CSR1kv device.
///
/// Operations on the same device are serialized by the session mutex, so two
/// routers sharing a device never interleave their mutating sequences.
pub struct CsrRoutingDriver {
    target: SessionTarget,
    connector: Arc<dyn SessionConnector>,
    nat_settle: Duration,
    session: Mutex<SessionSlot>,
    interfaces_enabled: AtomicBool,
}

impl CsrRoutingDriver {
    pub fn new(
        device: &HostingDevice,
        connector: Arc<dyn SessionConnector>,
        settings: CsrSettings,
    ) -> Self {
        Self {
            target: SessionTarget {
                address: SocketAddr::new(device.management_ip, device.port),
                connect_timeout: settings.connect_timeout,
                rpc_timeout: settings.push_timeout,
            },
            connector,
            nat_settle: settings.nat_settle,
            session: Mutex::new(None),
            interfaces_enabled: AtomicBool::new(false),
        }
    }

    /// Lock the session slot, connecting first if needed.
    async fn session(&self) -> Result<MutexGuard<'_, SessionSlot>, DriverError> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            let mut session = self.connector.connect(&self.target).await?;
            if !self.interfaces_enabled.load(Ordering::Acquire) {
                self.enable_data_interfaces(session.as_mut()).await;
            }
            *slot = Some(session);
        }
        Ok(slot)
    }

    /// Bring the trunk interfaces up. Failures are retried on the next connect.
    async fn enable_data_interfaces<S>(&self, session: &mut S)
    where
        S: ManagementSession + ?Sized,
    {
        for interface in DATA_INTERFACES {
            if let Err(e) = push(session, &snippets::enable_interface(interface)).await {
                warn!(
                    address = %self.target.address,
                    interface,
                    error = %e,
                    "Failed to enable data interface"
                );
                return;
            }
        }
        self.interfaces_enabled.store(true, Ordering::Release);
        info!(address = %self.target.address, "Data interfaces enabled");
    }

    /// Close out an operation, dropping the session if it failed.
    fn finish(
        &self,
        operation: &'static str,
        slot: &mut SessionSlot,
        result: Result<(), DriverError>,
    ) -> Result<(), DriverError> {
        match &result {
            Ok(()) => debug!(address = %self.target.address, operation, "Operation applied"),
            Err(e) => {
                warn!(
                    address = %self.target.address,
                    operation,
                    error = %e,
                    "Dropping management session after failure"
                );
                *slot = None;
            }
        }
        result
    }
}

fn active(
    slot: &mut SessionSlot,
) -> Result<&mut (dyn ManagementSession + 'static), DriverError> {
    slot.as_deref_mut()
        .ok_or_else(|| DriverError::Protocol("management session unavailable".to_string()))
}

async fn push<S>(session: &mut S, snippet: &Snippet) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let reply = session.edit_config(&snippet.to_config_xml()).await?;
    check_reply(snippet.name, &reply)
}

async fn running<S>(session: &mut S) -> Result<RunningConfig, DriverError>
where
    S: ManagementSession + ?Sized,
{
    Ok(RunningConfig::parse(&session.running_config().await?))
}

async fn clear_nat_translations<S>(session: &mut S) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    session
        .get(snippets::CLEAR_DYNAMIC_NAT_TRANSLATIONS)
        .await
        .map(|_| ())
}

async fn ensure_vrf<S>(session: &mut S, vrf: &str) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    if running(session).await?.vrfs().contains(&vrf) {
        debug!(vrf, "VRF already present");
        return Ok(());
    }
    push(session, &snippets::create_vrf(vrf)).await
}

async fn purge_vrf<S>(session: &mut S, vrf: &str) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    if !running(session).await?.vrfs().contains(&vrf) {
        return Ok(());
    }
    push(session, &snippets::remove_vrf(vrf)).await
}

async fn create_subinterface<S>(session: &mut S, vrf: &str, port: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let interface = interface_name(port)?;
    let config = running(session).await?;
    if !config.vrfs().contains(&vrf) {
        warn!(vrf, interface = %interface, "VRF missing on device, creating it");
        push(session, &snippets::create_vrf(vrf)).await?;
    }

    push(
        session,
        &snippets::create_subinterface(
            &interface,
            vlan(port)?,
            vrf,
            port.address.address,
            port.address.netmask(),
        ),
    )
    .await
}

async fn remove_subinterface<S>(session: &mut S, port: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let interface = interface_name(port)?;
    if running(session).await?.has_interface(&interface) {
        push(session, &snippets::remove_subinterface(&interface)).await?;
    }
    Ok(())
}

async fn add_ha<S>(session: &mut S, vrf: &str, port: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let Some(mode) = port.ha else {
        return Ok(());
    };
    let interface = interface_name(port)?;
    match mode {
        HaMode::Hsrp(ha) => {
            debug!(
                interface = %interface,
                group = ha.group,
                virtual_ip = %ha.virtual_ip,
                "Joining HSRP group"
            );
            push(
                session,
                &snippets::set_hsrp(&interface, vrf, ha.group, ha.priority, ha.virtual_ip),
            )
            .await
        }
        HaMode::Vrrp(_) | HaMode::Glbp(_) => {
            warn!(
                interface = %interface,
                mode = ?mode,
                "HA mode not supported on CSR1kv, skipping"
            );
            Ok(())
        }
    }
}

async fn remove_ha<S>(session: &mut S, port: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let Some(HaMode::Hsrp(ha)) = port.ha else {
        return Ok(());
    };
    let interface = interface_name(port)?;
    if running(session).await?.has_interface(&interface) {
        push(session, &snippets::remove_hsrp(&interface, ha.group)).await?;
    }
    Ok(())
}

async fn add_internal_network<S>(
    session: &mut S,
    vrf: &str,
    port: &BoundPort,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    create_subinterface(session, vrf, port).await?;
    add_ha(session, vrf, port).await
}

/// Leave the HA group before the subinterface goes away.
async fn remove_internal_network<S>(session: &mut S, port: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    remove_ha(session, port).await?;
    remove_subinterface(session, port).await
}

async fn add_gateway<S>(session: &mut S, vrf: &str, gateway: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    create_subinterface(session, vrf, gateway).await?;

    let Some(next_hop) = gateway.subnet_gateway else {
        return Ok(());
    };
    if !running(session)
        .await?
        .has_line(&snippets::default_route_line(vrf, next_hop))
    {
        push(session, &snippets::set_default_route(vrf, next_hop)).await?;
    }
    Ok(())
}

async fn remove_gateway<S>(session: &mut S, vrf: &str, gateway: &BoundPort) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    if let Some(next_hop) = gateway.subnet_gateway {
        if running(session)
            .await?
            .has_line(&snippets::default_route_line(vrf, next_hop))
        {
            push(session, &snippets::remove_default_route(vrf, next_hop)).await?;
        }
    }
    remove_subinterface(session, gateway).await
}

/// Create ACL, dynamic NAT rule and NAT sides. Caller holds the datastore lock.
async fn bind_source_nat<S>(
    session: &mut S,
    vrf: &str,
    port: &BoundPort,
    gateway: &BoundPort,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let acl = acl_name(port)?;
    let subnet = port.address.prefix();
    let inside = interface_name(port)?;
    let outside = interface_name(gateway)?;

    let config = running(session).await?;
    let permit = snippets::acl_permit_line(&subnet);
    let acl_present = config
        .find_children(&format!("ip access-list standard {}", acl))
        .contains(&permit.as_str());
    let rule_present = config.has_line(&snippets::dynamic_nat_line(&acl, &outside, vrf));

    if !acl_present {
        push(session, &snippets::create_acl(&acl, &subnet)).await?;
    }
    if !rule_present {
        push(session, &snippets::set_dynamic_nat(&acl, &outside, vrf)).await?;
    }
    push(session, &snippets::set_nat(&inside, NatSide::Inside)).await?;
    push(session, &snippets::set_nat(&outside, NatSide::Outside)).await
}

async fn locked_bind_source_nat<S>(
    session: &mut S,
    vrf: &str,
    port: &BoundPort,
    gateway: &BoundPort,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    check_reply("LOCK", &session.lock().await?)?;
    let result = bind_source_nat(session, vrf, port, gateway).await;
    let unlocked = match session.unlock().await {
        Ok(reply) => check_reply("UNLOCK", &reply),
        Err(e) => Err(e),
    };
    result.and(unlocked)
}

async fn unbind_source_nat<S>(
    session: &mut S,
    vrf: &str,
    port: &BoundPort,
    gateway: &BoundPort,
    settle: Duration,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let acl = acl_name(port)?;
    let inside = interface_name(port)?;
    let outside = interface_name(gateway)?;

    push(session, &snippets::remove_nat(&inside, NatSide::Inside)).await?;
    tokio::time::sleep(settle).await;
    clear_nat_translations(session).await?;

    let config = running(session).await?;
    if config.has_line(&snippets::dynamic_nat_line(&acl, &outside, vrf)) {
        push(session, &snippets::remove_dynamic_nat(&acl, &outside, vrf)).await?;
    }
    if config.has_line(&format!("ip access-list standard {}", acl)) {
        push(session, &snippets::remove_acl(&acl)).await?;
    }
    Ok(())
}

async fn add_static_nat<S>(session: &mut S, vrf: &str, fip: &FloatingIp) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let line = snippets::static_nat_line(fip.fixed, fip.floating, vrf);
    if running(session).await?.has_line(&line) {
        return Ok(());
    }
    push(session, &snippets::set_static_nat(fip.fixed, fip.floating, vrf)).await
}

async fn remove_static_nat<S>(
    session: &mut S,
    vrf: &str,
    gateway: &BoundPort,
    fip: &FloatingIp,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    let outside = interface_name(gateway)?;

    push(session, &snippets::remove_nat(&outside, NatSide::Outside)).await?;
    clear_nat_translations(session).await?;
    let line = snippets::static_nat_line(fip.fixed, fip.floating, vrf);
    if running(session).await?.has_line(&line) {
        push(session, &snippets::remove_static_nat(fip.fixed, fip.floating, vrf)).await?;
    }
    push(session, &snippets::set_nat(&outside, NatSide::Outside)).await
}

async fn update_route<S>(
    session: &mut S,
    vrf: &str,
    action: RouteAction,
    destination: &Ipv4Prefix,
    nexthop: Ipv4Addr,
) -> Result<(), DriverError>
where
    S: ManagementSession + ?Sized,
{
    match action {
        RouteAction::Replace => {
            // IOS adds a second next hop rather than replacing the first.
            let config = running(session).await?;
            let prefix = snippets::route_prefix(vrf, destination);
            let stale: Vec<Ipv4Addr> = config
                .find_lines(&prefix)
                .into_iter()
                .filter_map(|line| line.strip_prefix(prefix.as_str()))
                .filter_map(|rest| rest.split_whitespace().next())
                .filter_map(|hop| hop.parse::<Ipv4Addr>().ok())
                .filter(|hop| *hop != nexthop)
                .collect();
            let present = config.has_line(&snippets::route_line(vrf, destination, nexthop));

            for hop in stale {
                debug!(vrf, destination = %destination, nexthop = %hop, "Removing stale next hop");
                push(session, &snippets::remove_route(vrf, destination, hop)).await?;
            }
            if present {
                return Ok(());
            }
            push(session, &snippets::set_route(vrf, destination, nexthop)).await
        }
        RouteAction::Delete => {
            if !running(session)
                .await?
                .has_line(&snippets::route_line(vrf, destination, nexthop))
            {
                return Ok(());
            }
            push(session, &snippets::remove_route(vrf, destination, nexthop)).await
        }
    }
}

#[async_trait]
impl RoutingDriver for CsrRoutingDriver {
    async fn router_added(&self, router_id: &RouterId) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = ensure_vrf(active(&mut slot)?, &vrf).await;
        self.finish("router_added", &mut slot, result)
    }

    async fn router_removed(&self, router_id: &RouterId) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = purge_vrf(active(&mut slot)?, &vrf).await;
        self.finish("router_removed", &mut slot, result)
    }

    async fn internal_network_added(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = add_internal_network(active(&mut slot)?, &vrf, port).await;
        self.finish("internal_network_added", &mut slot, result)
    }

    async fn internal_network_removed(
        &self,
        _router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError> {
        let mut slot = self.session().await?;
        let result = remove_internal_network(active(&mut slot)?, port).await;
        self.finish("internal_network_removed", &mut slot, result)
    }

    async fn external_gateway_added(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = add_gateway(active(&mut slot)?, &vrf, gateway).await;
        self.finish("external_gateway_added", &mut slot, result)
    }

    async fn external_gateway_removed(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = remove_gateway(active(&mut slot)?, &vrf, gateway).await;
        self.finish("external_gateway_removed", &mut slot, result)
    }

    async fn enable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = locked_bind_source_nat(active(&mut slot)?, &vrf, port, gateway).await;
        self.finish("enable_internal_network_nat", &mut slot, result)
    }

    async fn disable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result =
            unbind_source_nat(active(&mut slot)?, &vrf, port, gateway, self.nat_settle).await;
        self.finish("disable_internal_network_nat", &mut slot, result)
    }

    async fn floating_ip_added(
        &self,
        router_id: &RouterId,
        _gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = add_static_nat(active(&mut slot)?, &vrf, floating_ip).await;
        self.finish("floating_ip_added", &mut slot, result)
    }

    async fn floating_ip_removed(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let mut slot = self.session().await?;
        let result = remove_static_nat(active(&mut slot)?, &vrf, gateway, floating_ip).await;
        self.finish("floating_ip_removed", &mut slot, result)
    }

    async fn routes_updated(
        &self,
        router_id: &RouterId,
        action: RouteAction,
        route: &RouteSpec,
    ) -> Result<(), DriverError> {
        let vrf = vrf_name(router_id);
        let (destination, nexthop) = parse_route(route)?;
        let mut slot = self.session().await?;
        let result = update_route(active(&mut slot)?, &vrf, action, &destination, nexthop).await;
        self.finish("routes_updated", &mut slot, result)
    }

    async fn clear_connection(&self) {
        let mut slot = self.session.lock().await;
        if slot.take().is_some() {
            debug!(address = %self.target.address, "Management session closed");
        }
    }
}
