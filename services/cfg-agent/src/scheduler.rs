//! Sync scheduling.
//!
//! Two periodic loops drive the agent:
//!
//! - the incremental loop drains routers flagged by notifications, fetches
//!   their specs and reconciles them, then processes pending deletions
//! - the full-sync loop, active whenever the resync flag is set (always at
//!   startup), reconciles every router the controller assigns to this agent
//!   and sweeps the device backlog
//!
//! Both loops hold the state mutex for a whole batch. Notifications only
//! touch the pending sets, which sit behind their own short-lived lock, so
//! they never wait on a running batch. The same goes for state reports,
//! which read counters refreshed when a batch ends. Inside a batch every
//! router's state moves into its own task, bounded by a semaphore, and moves
//! back once the task is joined. A task that panics leaves behind the copy
//! taken before it was spawned.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use hdcfg_id::{HostingDeviceId, NetworkId, RouterId};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::{AgentStateReport, Controller};
use crate::config::Config;
use crate::driver::RoutingDriver;
use crate::error::{AgentError, ControllerError, ReconcileError};
use crate::model::RouterSpec;
use crate::reconciler::{process_router, PassSummary};
use crate::registry::DeviceRegistry;
use crate::router::RouterState;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub host: String,
    pub rpc_loop_interval: Duration,
    pub full_sync_interval: Duration,
    pub max_concurrent_routers: usize,

    /// Single-router mode.
    pub router_id: Option<RouterId>,
    pub handle_internal_only_routers: bool,
    pub gateway_external_network_id: Option<NetworkId>,
    pub external_network_bridge: Option<String>,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            rpc_loop_interval: config.rpc_loop_interval,
            full_sync_interval: config.full_sync_interval,
            max_concurrent_routers: config.max_concurrent_routers,
            router_id: config.router_id,
            handle_internal_only_routers: config.handle_internal_only_routers,
            gateway_external_network_id: config.gateway_external_network_id,
            external_network_bridge: config.external_network_bridge.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            rpc_loop_interval: Duration::from_secs(crate::config::DEFAULT_RPC_LOOP_INTERVAL_SECS),
            full_sync_interval: Duration::from_secs(
                crate::config::DEFAULT_FULL_SYNC_INTERVAL_SECS,
            ),
            max_concurrent_routers: crate::config::DEFAULT_MAX_CONCURRENT_ROUTERS,
            router_id: None,
            handle_internal_only_routers: true,
            gateway_external_network_id: None,
            external_network_bridge: None,
        }
    }
}

/// A hosting device the controller took away from this agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct DeviceRemoval {
    routers: BTreeSet<RouterId>,
    deconfigure: bool,
}

/// Work queued by notifications.
#[derive(Debug, Default)]
struct PendingWork {
    updated: BTreeSet<RouterId>,
    removed: BTreeSet<RouterId>,
    removed_devices: BTreeMap<HostingDeviceId, DeviceRemoval>,
    full_sync: bool,
}

impl PendingWork {
    fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty() && self.removed_devices.is_empty()
    }
}

/// Everything a batch mutates.
struct AgentState {
    routers: HashMap<RouterId, RouterState>,
    registry: DeviceRegistry,
}

/// Result of reconciling a set of router specs.
#[derive(Debug, Clone, Copy, Default)]
struct BatchOutcome {
    processed: usize,
    failed: usize,
}

impl BatchOutcome {
    fn merge(&mut self, other: BatchOutcome) {
        self.processed += other.processed;
        self.failed += other.failed;
    }

    fn into_result(self) -> Result<(), AgentError> {
        if self.failed > 0 {
            Err(AgentError::Batch {
                failed: self.failed,
                total: self.processed,
            })
        } else {
            Ok(())
        }
    }
}

/// Drives reconciliation for every router assigned to this agent.
pub struct SyncScheduler {
    settings: SchedulerSettings,
    controller: Arc<dyn Controller>,
    state: Mutex<AgentState>,
    pending: StdMutex<PendingWork>,
    counters: StdMutex<AgentStateReport>,
}

impl SyncScheduler {
    pub fn new(
        settings: SchedulerSettings,
        controller: Arc<dyn Controller>,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            settings,
            controller,
            state: Mutex::new(AgentState {
                routers: HashMap::new(),
                registry,
            }),
            pending: StdMutex::new(PendingWork {
                full_sync: true,
                ..Default::default()
            }),
            counters: StdMutex::new(AgentStateReport::default()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingWork> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, AgentStateReport> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn router_deleted(&self, router_id: RouterId) {
        debug!(router_id = %router_id, "Router deleted");
        let mut pending = self.pending();
        pending.updated.remove(&router_id);
        pending.removed.insert(router_id);
    }

    pub fn routers_updated(&self, router_ids: impl IntoIterator<Item = RouterId>) {
        let mut pending = self.pending();
        for router_id in router_ids {
            debug!(router_id = %router_id, "Router updated");
            pending.removed.remove(&router_id);
            pending.updated.insert(router_id);
        }
    }

    pub fn router_removed_from_agent(&self, router_id: RouterId) {
        debug!(router_id = %router_id, "Router removed from agent");
        self.router_deleted(router_id);
    }

    pub fn router_added_to_agent(&self, router_ids: impl IntoIterator<Item = RouterId>) {
        self.routers_updated(router_ids);
    }

    /// Queue removal of a hosting device and every router on it.
    pub fn hosting_device_removed(
        &self,
        device_id: HostingDeviceId,
        router_ids: impl IntoIterator<Item = RouterId>,
        deconfigure: bool,
    ) {
        info!(
            hosting_device_id = %device_id,
            deconfigure,
            "Hosting device removed from agent"
        );
        let mut pending = self.pending();
        let removal = pending.removed_devices.entry(device_id).or_default();
        removal.routers.extend(router_ids);
        removal.deconfigure |= deconfigure;
    }

    /// The agent's assignment changed; resync everything.
    pub fn agent_updated(&self) {
        info!("Agent updated, scheduling full sync");
        self.request_full_sync();
    }

    pub fn request_full_sync(&self) {
        self.pending().full_sync = true;
    }

    pub fn needs_full_sync(&self) -> bool {
        self.pending().full_sync
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Run both loops until shutdown is signalled, then close every driver.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            host = %self.settings.host,
            rpc_loop_interval_secs = self.settings.rpc_loop_interval.as_secs_f64(),
            full_sync_interval_secs = self.settings.full_sync_interval.as_secs(),
            "Starting sync scheduler"
        );

        let mut rpc_timer = tokio::time::interval(self.settings.rpc_loop_interval);
        rpc_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut full_sync_timer = tokio::time::interval(self.settings.full_sync_interval);
        full_sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = full_sync_timer.tick() => {
                    if self.needs_full_sync() {
                        if let Err(e) = self.run_full_sync().await {
                            warn!(error = %e, "Full sync failed, will retry");
                        }
                    }
                }
                _ = rpc_timer.tick() => {
                    if let Err(e) = self.run_incremental_pass().await {
                        warn!(error = %e, "Incremental sync failed, full sync scheduled");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Reconcile routers flagged since the last pass.
    pub async fn run_incremental_pass(&self) -> Result<(), AgentError> {
        let work = {
            let mut pending = self.pending();
            if pending.is_empty() {
                return Ok(());
            }
            PendingWork {
                updated: std::mem::take(&mut pending.updated),
                removed: std::mem::take(&mut pending.removed),
                removed_devices: std::mem::take(&mut pending.removed_devices),
                full_sync: false,
            }
        };

        let mut state = self.state.lock().await;
        let result = self.incremental_batch(&mut state, work).await;
        self.refresh_counters(&state);
        if result.is_err() {
            self.request_full_sync();
        }
        result
    }

    async fn incremental_batch(
        &self,
        state: &mut AgentState,
        work: PendingWork,
    ) -> Result<(), AgentError> {
        let mut outcome = BatchOutcome::default();

        for (device_id, removal) in work.removed_devices {
            outcome.merge(self.remove_hosting_device(state, device_id, removal).await);
        }

        if !work.updated.is_empty() {
            let router_ids: Vec<RouterId> = work.updated.into_iter().collect();
            debug!(router_count = router_ids.len(), "Processing updated routers");
            let specs = self.controller.get_routers(&router_ids, &[]).await?;
            outcome.merge(self.process_routers(state, specs, false).await?);
        }

        if !work.removed.is_empty() {
            let router_ids: Vec<RouterId> = work.removed.into_iter().collect();
            outcome.merge(self.remove_routers(state, router_ids, true).await);
        }

        outcome.into_result()
    }

    /// Reconcile every router assigned to this agent and sweep the backlog.
    pub async fn run_full_sync(&self) -> Result<(), AgentError> {
        {
            let mut pending = self.pending();
            pending.updated.clear();
            pending.removed.clear();
            pending.full_sync = false;
        }

        info!("Starting full sync");
        let mut state = self.state.lock().await;
        let result = self.full_sync_batch(&mut state).await;
        self.refresh_counters(&state);
        match &result {
            Ok(()) => info!(router_count = state.routers.len(), "Full sync complete"),
            Err(e) => {
                error!(error = %e, "Full sync failed");
                self.request_full_sync();
            }
        }
        result
    }

    async fn full_sync_batch(&self, state: &mut AgentState) -> Result<(), AgentError> {
        let router_ids: Vec<RouterId> = self.settings.router_id.into_iter().collect();
        let specs = self.controller.get_routers(&router_ids, &[]).await?;
        let mut outcome = self.process_routers(state, specs, true).await?;

        let report = state.registry.check_backlog().await;

        if !report.reachable.is_empty() {
            info!(
                device_count = report.reachable.len(),
                "Resyncing routers on recovered hosting devices"
            );
            let specs = self.controller.get_routers(&[], &report.reachable).await?;
            outcome.merge(self.process_routers(state, specs, false).await?);
        }

        if !report.dead.is_empty() {
            if let Err(e) = self
                .controller
                .report_dead_hosting_devices(&report.dead)
                .await
            {
                warn!(error = %e, "Failed to report dead hosting devices");
            }
        }

        outcome.into_result()
    }

    /// Close every cached driver.
    pub async fn shutdown(&self) {
        self.state.lock().await.registry.shutdown().await;
    }

    // =========================================================================
    // Batch processing
    // =========================================================================

    /// External network routers must sit on to be handled by this agent.
    async fn target_external_network(&self) -> Result<Option<NetworkId>, AgentError> {
        if let Some(id) = self.settings.gateway_external_network_id {
            return Ok(Some(id));
        }
        if self.settings.external_network_bridge.is_none() {
            return Ok(None);
        }

        match self.controller.get_external_network_id().await {
            Ok(id) => Ok(id),
            Err(ControllerError::TooManyExternalNetworks) => Err(AgentError::Configuration(
                "the controller has more than one external network; \
                 set HDCFG_GATEWAY_EXTERNAL_NETWORK_ID to pick one"
                    .to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconcile the given specs. With `all_routers`, every known router
    /// missing from `specs` is torn down; otherwise only routers present in
    /// `specs` but no longer eligible are.
    async fn process_routers(
        &self,
        state: &mut AgentState,
        specs: Vec<RouterSpec>,
        all_routers: bool,
    ) -> Result<BatchOutcome, AgentError> {
        let mut outcome = BatchOutcome::default();

        let candidates: BTreeSet<RouterId> = if all_routers {
            state.routers.keys().copied().collect()
        } else {
            specs
                .iter()
                .map(|spec| spec.id)
                .filter(|id| state.routers.contains_key(id))
                .collect()
        };

        let specs: Vec<RouterSpec> = specs
            .into_iter()
            .filter(|spec| self.settings.router_id.is_none_or(|only| only == spec.id))
            .collect();

        // Resolved before any router leaves `state.routers`, so a lookup
        // failure cannot strand staged state.
        let needs_target = specs
            .iter()
            .any(|spec| spec.admin_state_up && spec.external_network_id().is_some());
        let target_network = if needs_target {
            self.target_external_network().await?
        } else {
            None
        };

        // Routers this agent still handles. Unreachable or driverless ones
        // count as current; filtered ones do not and are torn down below.
        let mut current = BTreeSet::new();
        let mut jobs = Vec::new();
        for spec in specs {
            if !spec.admin_state_up {
                debug!(router_id = %spec.id, "Router is administratively down");
                continue;
            }

            match spec.external_network_id() {
                None if !self.settings.handle_internal_only_routers => {
                    debug!(router_id = %spec.id, "Skipping internal-only router");
                    continue;
                }
                None => {}
                Some(network_id) => {
                    if target_network.is_some_and(|target| target != network_id) {
                        debug!(
                            router_id = %spec.id,
                            network_id = %network_id,
                            "Router is on another external network"
                        );
                        continue;
                    }
                }
            }
            current.insert(spec.id);

            let Some(device) = spec.hosting_device.clone() else {
                warn!(router_id = %spec.id, "Router has no hosting device");
                continue;
            };

            if !state.registry.is_reachable(spec.id, &device).await {
                debug!(
                    router_id = %spec.id,
                    hosting_device_id = %device.id,
                    "Skipping router on unreachable hosting device"
                );
                continue;
            }

            let driver = match state.registry.get_driver(spec.id, &device).await {
                Ok(driver) => driver,
                Err(e) => {
                    error!(router_id = %spec.id, error = %e, "Failed to get driver");
                    outcome.processed += 1;
                    outcome.failed += 1;
                    continue;
                }
            };

            let router_id = spec.id;
            let (router, is_new) = match state.routers.remove(&router_id) {
                Some(mut router) => {
                    router.update_desired(spec);
                    (router, false)
                }
                None => (RouterState::new(spec), true),
            };
            // A new router that panics is dropped so it is added again.
            let fallback = (!is_new).then(|| router.clone());
            jobs.push(((router_id, fallback), reconcile_job(router, driver, is_new)));
        }

        for ((router_id, fallback), result) in
            run_bounded(jobs, self.settings.max_concurrent_routers).await
        {
            outcome.processed += 1;
            match result {
                Ok((router, Ok(_))) => {
                    state.routers.insert(router.id(), router);
                }
                Ok((router, Err(JobError::Added(e)))) => {
                    error!(router_id = %router.id(), error = %e, "Failed to add router");
                    outcome.failed += 1;
                }
                Ok((router, Err(JobError::Pass(e)))) => {
                    error!(router_id = %router.id(), error = %e, "Failed to reconcile router");
                    outcome.failed += 1;
                    state.routers.insert(router.id(), router);
                }
                Err(e) => {
                    error!(router_id = %router_id, error = %e, "Router task panicked");
                    outcome.failed += 1;
                    if let Some(router) = fallback {
                        state.routers.insert(router_id, router);
                    }
                }
            }
        }

        let vanished: Vec<RouterId> = candidates.difference(&current).copied().collect();
        if !vanished.is_empty() {
            debug!(router_count = vanished.len(), "Removing vanished routers");
            outcome.merge(self.remove_routers(state, vanished, true).await);
        }

        Ok(outcome)
    }

    /// Forget routers, deconfiguring them first when asked to.
    ///
    /// Routers on a backlogged device are forgotten without deconfiguration.
    /// A router whose teardown fails is kept so a later sync retries it.
    async fn remove_routers(
        &self,
        state: &mut AgentState,
        router_ids: Vec<RouterId>,
        deconfigure: bool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut jobs = Vec::new();

        for router_id in router_ids {
            let Some(router) = state.routers.remove(&router_id) else {
                state.registry.remove_driver(&router_id).await;
                continue;
            };
            outcome.processed += 1;

            let device = router.hosting_device().cloned().filter(|_| deconfigure);
            let driver = match device {
                Some(device) if state.registry.is_backlogged(&device.id) => {
                    warn!(
                        router_id = %router_id,
                        hosting_device_id = %device.id,
                        "Hosting device is backlogged, removing router without deconfiguration"
                    );
                    None
                }
                Some(device) => match state.registry.get_driver(router_id, &device).await {
                    Ok(driver) => Some(driver),
                    Err(e) => {
                        error!(router_id = %router_id, error = %e, "Failed to get driver");
                        outcome.failed += 1;
                        state.routers.insert(router_id, router);
                        continue;
                    }
                },
                None => None,
            };

            match driver {
                Some(driver) => jobs.push((router.clone(), teardown_job(router, driver))),
                None => {
                    state.registry.remove_driver(&router_id).await;
                    info!(router_id = %router_id, "Router removed");
                }
            }
        }

        for (fallback, result) in run_bounded(jobs, self.settings.max_concurrent_routers).await {
            match result {
                Ok((router, Ok(()))) => {
                    state.registry.remove_driver(&router.id()).await;
                    info!(router_id = %router.id(), "Router removed");
                }
                Ok((router, Err(e))) => {
                    error!(router_id = %router.id(), error = %e, "Failed to remove router");
                    outcome.failed += 1;
                    state.routers.insert(router.id(), router);
                }
                Err(e) => {
                    error!(router_id = %fallback.id(), error = %e, "Router teardown task panicked");
                    outcome.failed += 1;
                    state.routers.insert(fallback.id(), fallback);
                }
            }
        }

        outcome
    }

    async fn remove_hosting_device(
        &self,
        state: &mut AgentState,
        device_id: HostingDeviceId,
        removal: DeviceRemoval,
    ) -> BatchOutcome {
        let mut router_ids = removal.routers;
        router_ids.extend(
            state
                .routers
                .values()
                .filter(|router| router.hosting_device_id() == Some(device_id))
                .map(RouterState::id),
        );

        let outcome = self
            .remove_routers(state, router_ids.into_iter().collect(), removal.deconfigure)
            .await;
        let orphaned = state.registry.drop_device(&device_id).await;
        info!(
            hosting_device_id = %device_id,
            orphaned_routers = orphaned.len(),
            "Hosting device removed"
        );
        outcome
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Counters as of the last finished batch. Never waits on a running one.
    pub fn state_report(&self, start_flag: bool) -> AgentStateReport {
        AgentStateReport {
            host: self.settings.host.clone(),
            start_flag,
            ..self.counters().clone()
        }
    }

    fn refresh_counters(&self, state: &AgentState) {
        let mut report = AgentStateReport {
            routers: state.routers.len(),
            ..Default::default()
        };
        for router in state.routers.values() {
            let desired = router.desired();
            if desired.gw_port.is_some() {
                report.ex_gw_ports += 1;
            }
            report.interfaces += desired.interfaces.len();
            report.floating_ips += desired.floating_ips.len();
            if let Some(device_id) = router.hosting_device_id() {
                *report.hosting_devices.entry(device_id).or_default() += 1;
            }
        }
        report.non_responding_hosting_devices = state.registry.backlogged_devices();
        *self.counters() = report;
    }

    /// Run `f` against the current router map and registry.
    pub async fn inspect<R>(
        &self,
        f: impl FnOnce(&HashMap<RouterId, RouterState>, &DeviceRegistry) -> R,
    ) -> R {
        let state = self.state.lock().await;
        f(&state.routers, &state.registry)
    }
}

#[derive(Debug, Error)]
enum JobError {
    /// `router_added` failed; the router is dropped so it is added again next time.
    #[error(transparent)]
    Added(ReconcileError),

    #[error(transparent)]
    Pass(ReconcileError),
}

type ReconcileJob = (RouterState, Result<PassSummary, JobError>);

fn reconcile_job(
    mut router: RouterState,
    driver: Arc<dyn RoutingDriver>,
    is_new: bool,
) -> impl Future<Output = ReconcileJob> + Send + 'static {
    async move {
        if is_new {
            if let Err(e) = driver.router_added(&router.id()).await {
                let e = ReconcileError::driver("router_added")(e);
                return (router, Err(JobError::Added(e)));
            }
        }
        let result = process_router(&mut router, driver.as_ref())
            .await
            .map_err(JobError::Pass);
        (router, result)
    }
}

fn teardown_job(
    mut router: RouterState,
    driver: Arc<dyn RoutingDriver>,
) -> impl Future<Output = (RouterState, Result<(), ReconcileError>)> + Send + 'static {
    async move {
        router.mark_for_teardown();
        let result = match process_router(&mut router, driver.as_ref()).await {
            Ok(_) => driver
                .router_removed(&router.id())
                .await
                .map_err(ReconcileError::driver("router_removed")),
            Err(e) => Err(e),
        };
        (router, result)
    }
}

/// Run `jobs` on the runtime, at most `limit` at a time, and collect every
/// outcome next to its key. A panicked job still yields its key.
async fn run_bounded<K, F>(
    jobs: Vec<(K, F)>,
    limit: usize,
) -> Vec<(K, Result<F::Output, JoinError>)>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();
    let mut keys: HashMap<Id, K> = HashMap::with_capacity(jobs.len());
    for (key, job) in jobs {
        let semaphore = Arc::clone(&semaphore);
        let handle = set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            job.await
        });
        keys.insert(handle.id(), key);
    }

    let mut results = Vec::with_capacity(keys.len());
    while let Some(joined) = set.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, output)) => (id, Ok(output)),
            Err(e) => (e.id(), Err(e)),
        };
        if let Some(key) = keys.remove(&id) {
            results.push((key, result));
        }
    }
    results
}
