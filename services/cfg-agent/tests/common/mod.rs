//! Shared fakes and spec builders for the agent integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use hdcfg_agent::client::{AgentStateReport, Controller};
use hdcfg_agent::driver::{DriverCatalog, DriverFactory, RoutingDriver};
use hdcfg_agent::error::{ControllerError, DriverError};
use hdcfg_agent::model::{
    ExternalGatewayInfo, FixedIp, FloatingIpSpec, HostingDevice, HostingInfo, PortSpec,
    RouteSpec, RouterSpec, SubnetInfo,
};
use hdcfg_agent::probe::ReachabilityProbe;
use hdcfg_agent::registry::DeviceRegistry;
use hdcfg_agent::router::{BoundPort, FloatingIp};
use hdcfg_agent::scheduler::{SchedulerSettings, SyncScheduler};
use hdcfg_id::{FloatingIpId, HostingDeviceId, NetworkId, PortId, RouterId};
use hdcfg_reconcile::RouteAction;
use tokio::sync::{Notify, Semaphore};

pub const FAMILY: &str = "recording";

// =============================================================================
// Recording driver
// =============================================================================

/// One driver operation that reached the (fake) device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RouterAdded,
    RouterRemoved,
    InternalNetworkAdded(PortId),
    InternalNetworkRemoved(PortId),
    ExternalGatewayAdded(PortId),
    ExternalGatewayRemoved(PortId),
    EnableNat(PortId),
    DisableNat(PortId),
    FloatingIpAdded(FloatingIpId, Ipv4Addr),
    FloatingIpRemoved(FloatingIpId, Ipv4Addr),
    RouteUpdated(RouteAction, String, String),
}

impl Call {
    pub fn is_gateway_or_nat(&self) -> bool {
        matches!(
            self,
            Call::ExternalGatewayAdded(_)
                | Call::ExternalGatewayRemoved(_)
                | Call::EnableNat(_)
                | Call::DisableNat(_)
        )
    }
}

type FailWhen = Arc<dyn Fn(&Call) -> bool + Send + Sync>;

/// Calls recorded across every driver a factory created.
#[derive(Default)]
pub struct DriverLog {
    calls: Mutex<Vec<(HostingDeviceId, RouterId, Call)>>,
    clears: Mutex<Vec<HostingDeviceId>>,
    fail_when: Mutex<Option<FailWhen>>,
    panic_when: Mutex<Option<FailWhen>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    gated: Notify,
}

impl DriverLog {
    /// Fail every call matching `predicate` until [`DriverLog::heal`].
    pub fn fail_when(&self, predicate: impl Fn(&Call) -> bool + Send + Sync + 'static) {
        *self.fail_when.lock().unwrap() = Some(Arc::new(predicate));
    }

    /// Panic inside the driver on every call matching `predicate` until
    /// [`DriverLog::heal`].
    pub fn panic_when(&self, predicate: impl Fn(&Call) -> bool + Send + Sync + 'static) {
        *self.panic_when.lock().unwrap() = Some(Arc::new(predicate));
    }

    pub fn heal(&self) {
        *self.fail_when.lock().unwrap() = None;
        *self.panic_when.lock().unwrap() = None;
    }

    /// Park every `router_added` call until [`DriverLog::open`].
    pub fn close(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.close();
        }
    }

    /// Resolves once some call is parked at the gate.
    pub async fn parked(&self) {
        self.gated.notified().await;
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.gated.notify_one();
            // Closing the semaphore is what lets callers through.
            let _ = gate.acquire().await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, call)| call.clone())
            .collect()
    }

    pub fn calls_for(&self, router_id: RouterId) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, id, _)| *id == router_id)
            .map(|(_, _, call)| call.clone())
            .collect()
    }

    pub fn calls_on(&self, device_id: HostingDeviceId) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == device_id)
            .map(|(_, _, call)| call.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn clears(&self, device_id: HostingDeviceId) -> usize {
        self.clears
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == device_id)
            .count()
    }

    fn record(
        &self,
        device_id: HostingDeviceId,
        router_id: &RouterId,
        call: Call,
    ) -> Result<(), DriverError> {
        let explode = self.panic_when.lock().unwrap().clone();
        if explode.is_some_and(|explode| explode(&call)) {
            panic!("driver crashed on {:?}", call);
        }
        let fail = self.fail_when.lock().unwrap().clone();
        if fail.is_some_and(|fail| fail(&call)) {
            return Err(DriverError::Protocol(format!("injected failure on {:?}", call)));
        }
        self.calls.lock().unwrap().push((device_id, *router_id, call));
        Ok(())
    }
}

pub struct RecordingDriver {
    device_id: HostingDeviceId,
    log: Arc<DriverLog>,
}

#[async_trait]
impl RoutingDriver for RecordingDriver {
    async fn router_added(&self, router_id: &RouterId) -> Result<(), DriverError> {
        self.log.pass_gate().await;
        self.log.record(self.device_id, router_id, Call::RouterAdded)
    }

    async fn router_removed(&self, router_id: &RouterId) -> Result<(), DriverError> {
        self.log.record(self.device_id, router_id, Call::RouterRemoved)
    }

    async fn internal_network_added(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::InternalNetworkAdded(port.id))
    }

    async fn internal_network_removed(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::InternalNetworkRemoved(port.id))
    }

    async fn external_gateway_added(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::ExternalGatewayAdded(gateway.id))
    }

    async fn external_gateway_removed(
        &self,
        router_id: &RouterId,
        gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::ExternalGatewayRemoved(gateway.id))
    }

    async fn enable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        _gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::EnableNat(port.id))
    }

    async fn disable_internal_network_nat(
        &self,
        router_id: &RouterId,
        port: &BoundPort,
        _gateway: &BoundPort,
    ) -> Result<(), DriverError> {
        self.log
            .record(self.device_id, router_id, Call::DisableNat(port.id))
    }

    async fn floating_ip_added(
        &self,
        router_id: &RouterId,
        _gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError> {
        self.log.record(
            self.device_id,
            router_id,
            Call::FloatingIpAdded(floating_ip.id, floating_ip.fixed),
        )
    }

    async fn floating_ip_removed(
        &self,
        router_id: &RouterId,
        _gateway: &BoundPort,
        floating_ip: &FloatingIp,
    ) -> Result<(), DriverError> {
        self.log.record(
            self.device_id,
            router_id,
            Call::FloatingIpRemoved(floating_ip.id, floating_ip.fixed),
        )
    }

    async fn routes_updated(
        &self,
        router_id: &RouterId,
        action: RouteAction,
        route: &RouteSpec,
    ) -> Result<(), DriverError> {
        self.log.record(
            self.device_id,
            router_id,
            Call::RouteUpdated(action, route.destination.clone(), route.nexthop.clone()),
        )
    }

    async fn clear_connection(&self) {
        self.log.clears.lock().unwrap().push(self.device_id);
    }
}

/// Creates [`RecordingDriver`]s that share one [`DriverLog`].
#[derive(Default)]
pub struct RecordingFactory {
    pub log: Arc<DriverLog>,
    created: AtomicUsize,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// A standalone driver writing to this factory's log.
    pub fn driver(&self, device_id: HostingDeviceId) -> RecordingDriver {
        RecordingDriver {
            device_id,
            log: Arc::clone(&self.log),
        }
    }
}

impl DriverFactory for RecordingFactory {
    fn create(&self, device: &HostingDevice) -> Result<Arc<dyn RoutingDriver>, DriverError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.driver(device.id)))
    }
}

// =============================================================================
// Scripted probe
// =============================================================================

/// Every device is alive unless marked down.
#[derive(Default)]
pub struct ScriptedProbe {
    down: Mutex<HashSet<HostingDeviceId>>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_alive(&self, device_id: HostingDeviceId, alive: bool) {
        let mut down = self.down.lock().unwrap();
        if alive {
            down.remove(&device_id);
        } else {
            down.insert(device_id);
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn is_alive(&self, device: &HostingDevice) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !self.down.lock().unwrap().contains(&device.id)
    }
}

// =============================================================================
// Fake controller
// =============================================================================

/// In-memory controller serving a mutable router list.
#[derive(Default)]
pub struct FakeController {
    routers: Mutex<HashMap<RouterId, RouterSpec>>,
    external_network: Mutex<Option<NetworkId>>,
    too_many_external_networks: Mutex<bool>,
    fail_sync: Mutex<bool>,
    sync_requests: Mutex<Vec<(Vec<RouterId>, Vec<HostingDeviceId>)>>,
    dead_reports: Mutex<Vec<Vec<HostingDeviceId>>>,
    state_reports: Mutex<Vec<AgentStateReport>>,
    reject_state_reports: Mutex<bool>,
}

impl FakeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert(&self, spec: RouterSpec) {
        self.routers.lock().unwrap().insert(spec.id, spec);
    }

    pub fn delete(&self, router_id: RouterId) {
        self.routers.lock().unwrap().remove(&router_id);
    }

    pub fn set_external_network(&self, network_id: Option<NetworkId>) {
        *self.external_network.lock().unwrap() = network_id;
    }

    pub fn set_too_many_external_networks(&self, value: bool) {
        *self.too_many_external_networks.lock().unwrap() = value;
    }

    pub fn set_fail_sync(&self, value: bool) {
        *self.fail_sync.lock().unwrap() = value;
    }

    pub fn sync_requests(&self) -> Vec<(Vec<RouterId>, Vec<HostingDeviceId>)> {
        self.sync_requests.lock().unwrap().clone()
    }

    pub fn dead_reports(&self) -> Vec<Vec<HostingDeviceId>> {
        self.dead_reports.lock().unwrap().clone()
    }

    pub fn state_reports(&self) -> Vec<AgentStateReport> {
        self.state_reports.lock().unwrap().clone()
    }

    /// Answer state reports the way a controller without the endpoint does.
    pub fn set_reject_state_reports(&self, value: bool) {
        *self.reject_state_reports.lock().unwrap() = value;
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn get_routers(
        &self,
        router_ids: &[RouterId],
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<Vec<RouterSpec>, ControllerError> {
        self.sync_requests
            .lock()
            .unwrap()
            .push((router_ids.to_vec(), hosting_device_ids.to_vec()));

        if *self.fail_sync.lock().unwrap() {
            return Err(ControllerError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let routers = self.routers.lock().unwrap();
        let mut specs: Vec<RouterSpec> = routers
            .values()
            .filter(|spec| router_ids.is_empty() || router_ids.contains(&spec.id))
            .filter(|spec| {
                hosting_device_ids.is_empty()
                    || spec
                        .hosting_device
                        .as_ref()
                        .is_some_and(|device| hosting_device_ids.contains(&device.id))
            })
            .cloned()
            .collect();
        specs.sort_by_key(|spec| spec.id);
        Ok(specs)
    }

    async fn get_external_network_id(&self) -> Result<Option<NetworkId>, ControllerError> {
        if *self.too_many_external_networks.lock().unwrap() {
            return Err(ControllerError::TooManyExternalNetworks);
        }
        Ok(*self.external_network.lock().unwrap())
    }

    async fn report_dead_hosting_devices(
        &self,
        hosting_device_ids: &[HostingDeviceId],
    ) -> Result<(), ControllerError> {
        self.dead_reports
            .lock()
            .unwrap()
            .push(hosting_device_ids.to_vec());
        Ok(())
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<(), ControllerError> {
        if *self.reject_state_reports.lock().unwrap() {
            return Err(ControllerError::NotSupported("state reports"));
        }
        self.state_reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub controller: Arc<FakeController>,
    pub factory: Arc<RecordingFactory>,
    pub probe: Arc<ScriptedProbe>,
    pub scheduler: Arc<SyncScheduler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SchedulerSettings::default(), Duration::from_secs(300))
    }

    pub fn with_settings(settings: SchedulerSettings, dead_timeout: Duration) -> Self {
        let controller = FakeController::new();
        let factory = RecordingFactory::new();
        let probe = ScriptedProbe::new();

        let catalog = DriverCatalog::new().with(FAMILY, factory.clone());
        let registry = DeviceRegistry::new(catalog, probe.clone(), dead_timeout);
        let scheduler = Arc::new(SyncScheduler::new(settings, controller.clone(), registry));

        Self {
            controller,
            factory,
            probe,
            scheduler,
        }
    }

    pub fn log(&self) -> &DriverLog {
        &self.factory.log
    }

    pub async fn router_ids(&self) -> Vec<RouterId> {
        let mut ids = self
            .scheduler
            .inspect(|routers, _| routers.keys().copied().collect::<Vec<_>>())
            .await;
        ids.sort();
        ids
    }

    pub async fn has_driver(&self, device_id: HostingDeviceId) -> bool {
        self.scheduler
            .inspect(|_, registry| registry.has_driver(&device_id))
            .await
    }

    pub async fn is_backlogged(&self, device_id: HostingDeviceId) -> bool {
        self.scheduler
            .inspect(|_, registry| registry.is_backlogged(&device_id))
            .await
    }
}

// =============================================================================
// Spec builders
// =============================================================================

/// A device that finished booting an hour ago.
pub fn device() -> HostingDevice {
    HostingDevice {
        id: HostingDeviceId::new(),
        family: FAMILY.to_string(),
        management_ip: "192.0.2.10".parse().unwrap(),
        port: 22,
        created_at: Utc::now() - TimeDelta::hours(1),
        booting_time_secs: 0,
    }
}

/// A port with one fixed IP on `cidr`.
pub fn port(ip: &str, cidr: &str, gateway_ip: Option<&str>, vlan: u32) -> PortSpec {
    PortSpec {
        id: PortId::new(),
        admin_state_up: true,
        fixed_ips: vec![FixedIp {
            ip_address: ip.to_string(),
            subnet_id: None,
        }],
        subnet: Some(SubnetInfo {
            cidr: cidr.to_string(),
            gateway_ip: gateway_ip.map(str::to_string),
        }),
        hosting_info: Some(HostingInfo {
            segmentation_id: vlan,
            hosting_port_name: "t1_p:0".to_string(),
        }),
        ha_info: None,
    }
}

pub fn internal_port(ip: &str, cidr: &str, vlan: u32) -> PortSpec {
    port(ip, cidr, None, vlan)
}

pub fn gateway_port(ip: &str) -> PortSpec {
    let mut gw = port(ip, "172.16.0.0/24", Some("172.16.0.1"), 100);
    gw.hosting_info = Some(HostingInfo {
        segmentation_id: 100,
        hosting_port_name: "t2_p:0".to_string(),
    });
    gw
}

pub fn floating_ip(floating: &str, fixed: &str) -> FloatingIpSpec {
    FloatingIpSpec {
        id: FloatingIpId::new(),
        floating_ip_address: floating.to_string(),
        fixed_ip_address: Some(fixed.to_string()),
        port_id: Some(PortId::new()),
    }
}

pub fn route(destination: &str, nexthop: &str) -> RouteSpec {
    RouteSpec {
        destination: destination.to_string(),
        nexthop: nexthop.to_string(),
    }
}

/// An empty router hosted on `device`.
pub fn router_on(device: &HostingDevice) -> RouterSpec {
    let mut spec = RouterSpec::new(RouterId::new());
    spec.hosting_device = Some(device.clone());
    spec
}

/// Attach a gateway on `network_id` to `spec`.
pub fn with_gateway(mut spec: RouterSpec, gateway: PortSpec, network_id: NetworkId) -> RouterSpec {
    spec.gw_port = Some(gateway);
    spec.external_gateway_info = Some(ExternalGatewayInfo {
        network_id: Some(network_id),
    });
    spec
}
