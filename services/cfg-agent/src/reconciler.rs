//! Router reconciliation.
//!
//! [`process_router`] converges the device configuration of one router toward
//! its desired spec. Steps run in a fixed order because later ones depend on
//! earlier ones:
//!
//! 1. Internal ports (subinterfaces)
//! 2. External gateway, followed by the SNAT state of every internal port
//! 3. Floating IPs, only while the router has a gateway
//! 4. Static routes
//!
//! Applied state is updated after each acknowledged push. A failed push ends
//! the pass immediately, leaving the applied state at exactly what reached
//! the device; the next pass picks up from there.

use std::collections::BTreeSet;

use hdcfg_id::{PortId, RouterId};
use hdcfg_reconcile::{diff_keyed, plan_route_changes, RouteAction};
use tracing::{debug, info};

use crate::driver::RoutingDriver;
use crate::error::ReconcileError;
use crate::router::{BoundPort, FloatingIp, RouterState, SnatAction};

/// What a pass changed on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Number of driver operations issued.
    pub operations: usize,
}

impl PassSummary {
    pub fn is_noop(&self) -> bool {
        self.operations == 0
    }
}

/// Issues driver operations for one router and counts them.
struct Pass<'a> {
    router_id: RouterId,
    driver: &'a dyn RoutingDriver,
    operations: usize,
}

impl Pass<'_> {
    async fn enable_nat(&mut self, port: &BoundPort, gateway: &BoundPort) -> Result<(), ReconcileError> {
        self.operations += 1;
        self.driver
            .enable_internal_network_nat(&self.router_id, port, gateway)
            .await
            .map_err(ReconcileError::driver("enable_internal_network_nat"))
    }

    async fn disable_nat(&mut self, port: &BoundPort, gateway: &BoundPort) -> Result<(), ReconcileError> {
        self.operations += 1;
        self.driver
            .disable_internal_network_nat(&self.router_id, port, gateway)
            .await
            .map_err(ReconcileError::driver("disable_internal_network_nat"))
    }

    async fn remove_floating_ip(
        &mut self,
        gateway: &BoundPort,
        fip: &FloatingIp,
    ) -> Result<(), ReconcileError> {
        self.operations += 1;
        self.driver
            .floating_ip_removed(&self.router_id, gateway, fip)
            .await
            .map_err(ReconcileError::driver("floating_ip_removed"))
    }
}

/// Converge one router. See the module docs for the step order.
pub async fn process_router(
    router: &mut RouterState,
    driver: &dyn RoutingDriver,
) -> Result<PassSummary, ReconcileError> {
    let mut pass = Pass {
        router_id: router.id,
        driver,
        operations: 0,
    };

    sync_internal_ports(router, &mut pass).await?;
    sync_gateway(router, &mut pass).await?;
    sync_snat(router, &mut pass).await?;
    if router.desired.gw_port.is_some() {
        sync_floating_ips(router, &mut pass).await?;
    }
    sync_routes(router, &mut pass).await?;

    let summary = PassSummary {
        operations: pass.operations,
    };
    if summary.is_noop() {
        debug!(router_id = %router.id, "Router already converged");
    } else {
        info!(
            router_id = %router.id,
            operations = summary.operations,
            "Router reconciled"
        );
    }
    Ok(summary)
}

async fn sync_internal_ports(
    router: &mut RouterState,
    pass: &mut Pass<'_>,
) -> Result<(), ReconcileError> {
    let desired_up: Vec<_> = router
        .desired
        .interfaces
        .iter()
        .filter(|port| port.admin_state_up)
        .cloned()
        .collect();
    let desired_ids: BTreeSet<PortId> = desired_up.iter().map(|port| port.id).collect();
    let applied_ids: BTreeSet<PortId> = router.internal_ports.iter().map(|port| port.id).collect();

    // NAT for new ports goes on right away when the gateway is staying.
    let gateway_kept = router
        .gateway
        .as_ref()
        .filter(|gw| router.desired.gw_port.as_ref().map(|p| p.id) == Some(gw.id))
        .cloned();
    let nat_gateway = gateway_kept.filter(|_| router.desired.enable_snat);

    for spec in desired_up.iter().filter(|port| !applied_ids.contains(&port.id)) {
        let port = BoundPort::bind_internal(spec, router.desired.ha_info.as_ref())?;
        pass.operations += 1;
        pass.driver
            .internal_network_added(&router.id, &port)
            .await
            .map_err(ReconcileError::driver("internal_network_added"))?;
        debug!(router_id = %router.id, port_id = %port.id, "Internal port added");
        router.internal_ports.push(port.clone());

        if let Some(gateway) = &nat_gateway {
            pass.enable_nat(&port, gateway).await?;
            router.nat_ports.insert(port.id);
        }
    }

    let stale: Vec<BoundPort> = router
        .internal_ports
        .iter()
        .filter(|port| !desired_ids.contains(&port.id))
        .cloned()
        .collect();

    for port in stale {
        if router.nat_ports.contains(&port.id) {
            if let Some(gateway) = router.gateway.clone() {
                pass.disable_nat(&port, &gateway).await?;
            }
            router.nat_ports.remove(&port.id);
        }

        pass.operations += 1;
        pass.driver
            .internal_network_removed(&router.id, &port)
            .await
            .map_err(ReconcileError::driver("internal_network_removed"))?;
        debug!(router_id = %router.id, port_id = %port.id, "Internal port removed");
        router.internal_ports.retain(|p| p.id != port.id);
    }

    Ok(())
}

async fn sync_gateway(router: &mut RouterState, pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    let desired = router.desired.gw_port.as_ref().map(BoundPort::bind).transpose()?;

    if let Some(applied) = router.gateway.clone() {
        if desired.as_ref().is_some_and(|gw| gw.id == applied.id) {
            return Ok(());
        }
        teardown_gateway(router, &applied, pass).await?;
    }

    if let Some(gateway) = desired {
        pass.operations += 1;
        pass.driver
            .external_gateway_added(&router.id, &gateway)
            .await
            .map_err(ReconcileError::driver("external_gateway_added"))?;
        info!(router_id = %router.id, port_id = %gateway.id, "External gateway added");
        router.gateway = Some(gateway);
    }

    Ok(())
}

/// Release floating IPs and NAT, then remove the gateway itself.
async fn teardown_gateway(
    router: &mut RouterState,
    gateway: &BoundPort,
    pass: &mut Pass<'_>,
) -> Result<(), ReconcileError> {
    for fip in router.floating_ips.clone() {
        pass.remove_floating_ip(gateway, &fip).await?;
        router.floating_ips.retain(|f| f.id != fip.id);
    }

    for port in router.internal_ports.clone() {
        if router.nat_ports.contains(&port.id) {
            pass.disable_nat(&port, gateway).await?;
            router.nat_ports.remove(&port.id);
        }
    }

    pass.operations += 1;
    pass.driver
        .external_gateway_removed(&router.id, gateway)
        .await
        .map_err(ReconcileError::driver("external_gateway_removed"))?;
    info!(router_id = %router.id, port_id = %gateway.id, "External gateway removed");
    router.gateway = None;
    Ok(())
}

/// Bring every internal port's NAT binding in line with the gateway and snat flag.
async fn sync_snat(router: &mut RouterState, pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    let actions = router.pending_snat_actions();
    if actions.is_empty() {
        return Ok(());
    }
    let Some(gateway) = router.gateway.clone() else {
        return Ok(());
    };

    for (port_id, action) in actions {
        let Some(port) = router
            .internal_ports
            .iter()
            .find(|p| p.id == port_id)
            .cloned()
        else {
            continue;
        };

        match action {
            SnatAction::Enable => {
                pass.enable_nat(&port, &gateway).await?;
                router.nat_ports.insert(port_id);
            }
            SnatAction::Disable => {
                pass.disable_nat(&port, &gateway).await?;
                router.nat_ports.remove(&port_id);
            }
        }
    }

    Ok(())
}

async fn sync_floating_ips(
    router: &mut RouterState,
    pass: &mut Pass<'_>,
) -> Result<(), ReconcileError> {
    let Some(gateway) = router.gateway.clone() else {
        return Ok(());
    };

    let mut desired = Vec::with_capacity(router.desired.floating_ips.len());
    for spec in &router.desired.floating_ips {
        if let Some(fip) = FloatingIp::bind(spec)? {
            desired.push(fip);
        }
    }

    let plan = diff_keyed(
        &router.floating_ips,
        &desired,
        |fip| fip.id,
        |old, new| old.fixed != new.fixed,
    );
    if plan.is_empty() {
        return Ok(());
    }

    for fip in &plan.removed {
        pass.remove_floating_ip(&gateway, fip).await?;
        router.floating_ips.retain(|f| f.id != fip.id);
    }

    for change in &plan.changed {
        debug!(
            router_id = %router.id,
            floating_ip_id = %change.new.id,
            from = %change.old.fixed,
            to = %change.new.fixed,
            "Floating IP remapped"
        );
        pass.remove_floating_ip(&gateway, &change.old).await?;
        router.floating_ips.retain(|f| f.id != change.old.id);

        pass.operations += 1;
        pass.driver
            .floating_ip_added(&router.id, &gateway, &change.new)
            .await
            .map_err(ReconcileError::driver("floating_ip_added"))?;
        router.floating_ips.push(change.new);
    }

    for fip in &plan.added {
        pass.operations += 1;
        pass.driver
            .floating_ip_added(&router.id, &gateway, fip)
            .await
            .map_err(ReconcileError::driver("floating_ip_added"))?;
        router.floating_ips.push(*fip);
    }

    Ok(())
}

async fn sync_routes(router: &mut RouterState, pass: &mut Pass<'_>) -> Result<(), ReconcileError> {
    let plan = plan_route_changes(&router.routes, &router.desired.routes, |route| {
        route.destination.as_str()
    });
    if plan.is_empty() {
        return Ok(());
    }

    for (action, route) in plan.into_actions() {
        pass.operations += 1;
        pass.driver
            .routes_updated(&router.id, action, &route)
            .await
            .map_err(ReconcileError::driver("routes_updated"))?;
        debug!(
            router_id = %router.id,
            action = %action,
            destination = %route.destination,
            nexthop = %route.nexthop,
            "Route updated"
        );
        match action {
            RouteAction::Replace => {
                router.routes.retain(|r| r.destination != route.destination);
                router.routes.push(route);
            }
            RouteAction::Delete => router.routes.retain(|r| *r != route),
        }
    }

    router.routes = router.desired.routes.clone();
    Ok(())
}
