//! Hosting device registry.
//!
//! The registry owns everything the agent knows about hosting devices:
//!
//! - which device each router is bound to
//! - one cached driver per device, shared by every router on it
//! - the backlog of devices that failed a liveness probe
//!
//! A device enters the backlog when a probe fails. From then on it is not
//! probed again until it has had time to boot (`created_at + booting_time`).
//! A backlogged device either answers a later probe and is released, or stays
//! silent past the dead timeout, measured from backlog insertion, and is
//! reported dead exactly once before being purged. Backlogged devices never
//! have a cached driver.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdcfg_id::{HostingDeviceId, RouterId};
use tracing::{debug, error, info, warn};

use crate::driver::{DriverCatalog, RoutingDriver};
use crate::error::RegistryError;
use crate::model::HostingDevice;
use crate::probe::ReachabilityProbe;

/// An unreachable device and the routers waiting on it.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub device: HostingDevice,
    pub affected_routers: BTreeSet<RouterId>,

    /// When the device was backlogged, never earlier than its expected boot completion.
    pub inserted_at: DateTime<Utc>,
}

/// Outcome of a backlog sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogReport {
    /// Devices that answered again and left the backlog.
    pub reachable: Vec<HostingDeviceId>,

    /// Devices that stayed silent past the dead timeout and were purged.
    pub dead: Vec<HostingDeviceId>,
}

impl BacklogReport {
    pub fn is_empty(&self) -> bool {
        self.reachable.is_empty() && self.dead.is_empty()
    }
}

/// Router bindings, driver cache and backlog.
pub struct DeviceRegistry {
    catalog: DriverCatalog,
    probe: Arc<dyn ReachabilityProbe>,
    dead_timeout: Duration,

    bindings: HashMap<RouterId, HostingDeviceId>,
    drivers: HashMap<HostingDeviceId, Arc<dyn RoutingDriver>>,
    backlog: BTreeMap<HostingDeviceId, BacklogEntry>,
}

impl DeviceRegistry {
    pub fn new(
        catalog: DriverCatalog,
        probe: Arc<dyn ReachabilityProbe>,
        dead_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            probe,
            dead_timeout,
            bindings: HashMap::new(),
            drivers: HashMap::new(),
            backlog: BTreeMap::new(),
        }
    }

    /// Driver for the router's device, creating and caching it on first use.
    ///
    /// Binding a router to a different device than before releases the old
    /// binding first.
    pub async fn get_driver(
        &mut self,
        router_id: RouterId,
        device: &HostingDevice,
    ) -> Result<Arc<dyn RoutingDriver>, RegistryError> {
        if self.backlog.contains_key(&device.id) {
            return Err(RegistryError::Backlogged(device.id));
        }

        if let Some(previous) = self.bindings.get(&router_id).copied() {
            if previous != device.id {
                warn!(
                    router_id = %router_id,
                    from = %previous,
                    to = %device.id,
                    "Router moved to another hosting device"
                );
                self.remove_driver(&router_id).await;
            }
        }

        let driver = match self.drivers.get(&device.id) {
            Some(driver) => driver.clone(),
            None => {
                let driver = self.catalog.create(device).map_err(|source| {
                    RegistryError::DriverCreation {
                        device_id: device.id,
                        source,
                    }
                })?;
                info!(
                    hosting_device_id = %device.id,
                    family = %device.family,
                    address = %device.management_ip,
                    "Created driver for hosting device"
                );
                self.drivers.insert(device.id, driver.clone());
                driver
            }
        };

        self.bindings.insert(router_id, device.id);
        Ok(driver)
    }

    /// Drop the router's binding. The device's driver is closed when no other
    /// router uses it.
    pub async fn remove_driver(&mut self, router_id: &RouterId) {
        let Some(device_id) = self.bindings.remove(router_id) else {
            return;
        };

        if self.bindings.values().any(|bound| *bound == device_id) {
            return;
        }

        self.evict(&device_id).await;
    }

    /// Probe the router's device unless it is already backlogged.
    pub async fn is_reachable(&mut self, router_id: RouterId, device: &HostingDevice) -> bool {
        self.is_reachable_at(router_id, device, Utc::now()).await
    }

    pub async fn is_reachable_at(
        &mut self,
        router_id: RouterId,
        device: &HostingDevice,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(entry) = self.backlog.get_mut(&device.id) {
            entry.affected_routers.insert(router_id);
            debug!(
                router_id = %router_id,
                hosting_device_id = %device.id,
                "Hosting device is backlogged"
            );
            return false;
        }

        if self.probe.is_alive(device).await {
            return true;
        }

        let inserted_at = now.max(device.booted_at());
        warn!(
            router_id = %router_id,
            hosting_device_id = %device.id,
            address = %device.management_ip,
            "Hosting device is not responding, adding to backlog"
        );
        self.backlog.insert(
            device.id,
            BacklogEntry {
                device: device.clone(),
                affected_routers: BTreeSet::from([router_id]),
                inserted_at,
            },
        );
        self.evict(&device.id).await;
        false
    }

    /// Re-probe backlogged devices that have had time to boot.
    pub async fn check_backlog(&mut self) -> BacklogReport {
        self.check_backlog_at(Utc::now()).await
    }

    pub async fn check_backlog_at(&mut self, now: DateTime<Utc>) -> BacklogReport {
        let mut report = BacklogReport::default();
        let candidates: Vec<(HostingDeviceId, HostingDevice, DateTime<Utc>)> = self
            .backlog
            .iter()
            .map(|(id, entry)| (*id, entry.device.clone(), entry.inserted_at))
            .collect();

        for (device_id, device, inserted_at) in candidates {
            if now < device.booted_at() {
                debug!(hosting_device_id = %device_id, "Hosting device still booting");
                continue;
            }

            if self.probe.is_alive(&device).await {
                info!(hosting_device_id = %device_id, "Hosting device is reachable again");
                self.backlog.remove(&device_id);
                report.reachable.push(device_id);
                continue;
            }

            let silent_for = (now - inserted_at).to_std().unwrap_or(Duration::ZERO);
            if silent_for > self.dead_timeout {
                error!(
                    hosting_device_id = %device_id,
                    silent_secs = silent_for.as_secs(),
                    "Hosting device declared dead"
                );
                self.backlog.remove(&device_id);
                report.dead.push(device_id);
            } else {
                debug!(
                    hosting_device_id = %device_id,
                    silent_secs = silent_for.as_secs(),
                    "Hosting device still not responding"
                );
            }
        }

        report
    }

    /// Backlogged devices and the routers waiting on them.
    pub fn backlogged_devices(&self) -> BTreeMap<HostingDeviceId, Vec<RouterId>> {
        self.backlog
            .iter()
            .map(|(id, entry)| (*id, entry.affected_routers.iter().copied().collect()))
            .collect()
    }

    pub fn is_backlogged(&self, device_id: &HostingDeviceId) -> bool {
        self.backlog.contains_key(device_id)
    }

    /// Forget a device the controller removed. Returns the routers that were bound to it.
    pub async fn drop_device(&mut self, device_id: &HostingDeviceId) -> Vec<RouterId> {
        let routers: Vec<RouterId> = self
            .bindings
            .iter()
            .filter(|(_, bound)| *bound == device_id)
            .map(|(router_id, _)| *router_id)
            .collect();
        for router_id in &routers {
            self.bindings.remove(router_id);
        }

        self.backlog.remove(device_id);
        self.evict(device_id).await;
        routers
    }

    /// Reset the management session of a device without dropping its driver.
    pub async fn clear_connection(&self, device_id: &HostingDeviceId) {
        if let Some(driver) = self.drivers.get(device_id) {
            driver.clear_connection().await;
        }
    }

    pub fn bound_device(&self, router_id: &RouterId) -> Option<HostingDeviceId> {
        self.bindings.get(router_id).copied()
    }

    pub fn has_driver(&self, device_id: &HostingDeviceId) -> bool {
        self.drivers.contains_key(device_id)
    }

    /// Close every cached driver.
    pub async fn shutdown(&mut self) {
        for (device_id, driver) in self.drivers.drain() {
            debug!(hosting_device_id = %device_id, "Closing driver");
            driver.clear_connection().await;
        }
        self.bindings.clear();
        info!("Device registry shut down");
    }

    async fn evict(&mut self, device_id: &HostingDeviceId) {
        if let Some(driver) = self.drivers.remove(device_id) {
            driver.clear_connection().await;
            info!(hosting_device_id = %device_id, "Evicted driver for hosting device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hdcfg_reconcile::RouteAction;

    use crate::driver::DriverFactory;
    use crate::error::DriverError;
    use crate::model::RouteSpec;
    use crate::router::{BoundPort, FloatingIp};

    struct FlagProbe {
        alive: AtomicBool,
        probes: AtomicUsize,
    }

    impl FlagProbe {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                probes: AtomicUsize::new(0),
            })
        }

        fn set(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn is_alive(&self, _device: &HostingDevice) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.alive.load(Ordering::SeqCst)
        }
    }

    /// Driver that only counts `clear_connection` calls.
    #[derive(Default)]
    struct NullDriver {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl RoutingDriver for NullDriver {
        async fn router_added(&self, _: &RouterId) -> Result<(), DriverError> {
            Ok(())
        }
        async fn router_removed(&self, _: &RouterId) -> Result<(), DriverError> {
            Ok(())
        }
        async fn internal_network_added(&self, _: &RouterId, _: &BoundPort) -> Result<(), DriverError> {
            Ok(())
        }
        async fn internal_network_removed(&self, _: &RouterId, _: &BoundPort) -> Result<(), DriverError> {
            Ok(())
        }
        async fn external_gateway_added(&self, _: &RouterId, _: &BoundPort) -> Result<(), DriverError> {
            Ok(())
        }
        async fn external_gateway_removed(&self, _: &RouterId, _: &BoundPort) -> Result<(), DriverError> {
            Ok(())
        }
        async fn enable_internal_network_nat(
            &self,
            _: &RouterId,
            _: &BoundPort,
            _: &BoundPort,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn disable_internal_network_nat(
            &self,
            _: &RouterId,
            _: &BoundPort,
            _: &BoundPort,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn floating_ip_added(
            &self,
            _: &RouterId,
            _: &BoundPort,
            _: &FloatingIp,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn floating_ip_removed(
            &self,
            _: &RouterId,
            _: &BoundPort,
            _: &FloatingIp,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn routes_updated(
            &self,
            _: &RouterId,
            _: RouteAction,
            _: &RouteSpec,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn clear_connection(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct NullFactory {
        created: Mutex<Vec<Arc<NullDriver>>>,
    }

    impl DriverFactory for NullFactory {
        fn create(&self, _device: &HostingDevice) -> Result<Arc<dyn RoutingDriver>, DriverError> {
            let driver = Arc::new(NullDriver::default());
            self.created.lock().unwrap().push(driver.clone());
            Ok(driver)
        }
    }

    fn device(created_at: DateTime<Utc>, booting_time_secs: u64) -> HostingDevice {
        HostingDevice {
            id: HostingDeviceId::new(),
            family: "CSR1kv".to_string(),
            management_ip: "192.0.2.10".parse().unwrap(),
            port: 22,
            created_at,
            booting_time_secs,
        }
    }

    fn registry(probe: Arc<FlagProbe>) -> (DeviceRegistry, Arc<NullFactory>) {
        let factory = Arc::new(NullFactory::default());
        let catalog = DriverCatalog::new().with("CSR1kv", factory.clone());
        (
            DeviceRegistry::new(catalog, probe, Duration::from_secs(300)),
            factory,
        )
    }

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + chrono::TimeDelta::seconds(secs)
    }

    #[tokio::test]
    async fn test_driver_shared_per_device() {
        let (mut registry, factory) = registry(FlagProbe::new(true));
        let device = device(Utc::now(), 0);
        let (r1, r2) = (RouterId::new(), RouterId::new());

        let d1 = registry.get_driver(r1, &device).await.unwrap();
        let d2 = registry.get_driver(r2, &device).await.unwrap();

        assert!(Arc::ptr_eq(&d1, &d2));
        assert_eq!(factory.created.lock().unwrap().len(), 1);
        assert_eq!(registry.bound_device(&r1), Some(device.id));
    }

    #[tokio::test]
    async fn test_remove_driver_evicts_when_unreferenced() {
        let (mut registry, factory) = registry(FlagProbe::new(true));
        let device = device(Utc::now(), 0);
        let (r1, r2) = (RouterId::new(), RouterId::new());
        registry.get_driver(r1, &device).await.unwrap();
        registry.get_driver(r2, &device).await.unwrap();

        registry.remove_driver(&r1).await;
        assert!(registry.has_driver(&device.id));

        registry.remove_driver(&r2).await;
        assert!(!registry.has_driver(&device.id));
        assert_eq!(
            factory.created.lock().unwrap()[0].closed.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_family_is_rejected() {
        let (mut registry, _) = registry(FlagProbe::new(true));
        let mut device = device(Utc::now(), 0);
        device.family = "ASR1k".to_string();

        let err = registry.get_driver(RouterId::new(), &device).await.err().unwrap();
        assert!(matches!(err, RegistryError::DriverCreation { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_device_is_backlogged_and_evicted() {
        let probe = FlagProbe::new(true);
        let (mut registry, _) = registry(probe.clone());
        let now = Utc::now();
        let device = device(at(now, -600), 60);
        let (r1, r2) = (RouterId::new(), RouterId::new());

        registry.get_driver(r1, &device).await.unwrap();
        probe.set(false);

        assert!(!registry.is_reachable_at(r1, &device, now).await);
        assert!(!registry.has_driver(&device.id));
        assert!(registry.is_backlogged(&device.id));

        // Already backlogged: no probe, router appended.
        assert!(!registry.is_reachable_at(r2, &device, now).await);
        assert_eq!(probe.probes(), 1);
        let mut expected = vec![r1, r2];
        expected.sort();
        assert_eq!(registry.backlogged_devices()[&device.id], expected);

        assert!(matches!(
            registry.get_driver(r1, &device).await.err(),
            Some(RegistryError::Backlogged(_))
        ));
    }

    #[tokio::test]
    async fn test_backlog_waits_for_boot_grace() {
        let probe = FlagProbe::new(false);
        let (mut registry, _) = registry(probe.clone());
        let now = Utc::now();
        let device = device(now, 420);

        assert!(!registry.is_reachable_at(RouterId::new(), &device, now).await);
        assert_eq!(probe.probes(), 1);

        probe.set(true);
        let report = registry.check_backlog_at(at(now, 419)).await;
        assert!(report.is_empty());
        assert_eq!(probe.probes(), 1);

        let report = registry.check_backlog_at(at(now, 421)).await;
        assert_eq!(report.reachable, vec![device.id]);
        assert!(!registry.is_backlogged(&device.id));
    }

    #[tokio::test]
    async fn test_dead_device_reported_once_and_purged() {
        let probe = FlagProbe::new(false);
        let (mut registry, _) = registry(probe.clone());
        let now = Utc::now();
        let device = device(at(now, -3600), 420);

        registry.is_reachable_at(RouterId::new(), &device, now).await;

        assert!(registry.check_backlog_at(at(now, 299)).await.is_empty());
        assert!(registry.check_backlog_at(at(now, 300)).await.is_empty());

        let report = registry.check_backlog_at(at(now, 301)).await;
        assert_eq!(report.dead, vec![device.id]);
        assert!(!registry.is_backlogged(&device.id));

        assert!(registry.check_backlog_at(at(now, 900)).await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_timeout_measured_from_boot_completion() {
        let probe = FlagProbe::new(false);
        let (mut registry, _) = registry(probe.clone());
        let now = Utc::now();
        // Probed right after creation: backlog insertion is pushed to boot completion.
        let device = device(now, 420);

        registry.is_reachable_at(RouterId::new(), &device, now).await;

        assert!(registry.check_backlog_at(at(now, 700)).await.dead.is_empty());
        assert_eq!(
            registry.check_backlog_at(at(now, 721)).await.dead,
            vec![device.id]
        );
    }

    #[tokio::test]
    async fn test_drop_device_forgets_bindings() {
        let (mut registry, _) = registry(FlagProbe::new(true));
        let device = device(Utc::now(), 0);
        let router = RouterId::new();
        registry.get_driver(router, &device).await.unwrap();

        let routers = registry.drop_device(&device.id).await;

        assert_eq!(routers, vec![router]);
        assert!(!registry.has_driver(&device.id));
        assert_eq!(registry.bound_device(&router), None);
    }

    #[tokio::test]
    async fn test_clear_connection_keeps_driver() {
        let (mut registry, factory) = registry(FlagProbe::new(true));
        let device = device(Utc::now(), 0);
        registry.get_driver(RouterId::new(), &device).await.unwrap();

        registry.clear_connection(&device.id).await;
        registry.clear_connection(&HostingDeviceId::new()).await;

        assert!(registry.has_driver(&device.id));
        assert_eq!(
            factory.created.lock().unwrap()[0].closed.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_drivers() {
        let (mut registry, factory) = registry(FlagProbe::new(true));
        registry
            .get_driver(RouterId::new(), &device(Utc::now(), 0))
            .await
            .unwrap();
        registry
            .get_driver(RouterId::new(), &device(Utc::now(), 0))
            .await
            .unwrap();

        registry.shutdown().await;

        for driver in factory.created.lock().unwrap().iter() {
            assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
        }
    }
}
