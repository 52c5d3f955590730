//! Machine handles that carry their own lease.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::lease::LeaseManager;
use crate::types::{LaunchInput, Lease, Machine, MachineId, MachineState};
use crate::wait;

/// Lease operations issued at once by a [`MachineSet`].
const LEASE_CONCURRENCY: usize = 20;

struct RefreshTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A machine together with the lease that allows mutating it.
///
/// Every mutation sends the held nonce; calling one without a lease fails
/// before anything reaches the fleet API.
pub struct LeasableMachine {
    fleet: Arc<dyn FleetApi>,
    leases: LeaseManager,
    machine: Mutex<Machine>,
    lease: Mutex<Option<String>>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl LeasableMachine {
    /// Wrap a machine. A machine launched with a lease TTL arrives leased.
    #[must_use]
    pub fn new(fleet: Arc<dyn FleetApi>, machine: Machine) -> Self {
        let nonce = machine.lease_nonce.clone();
        Self {
            leases: LeaseManager::new(Arc::clone(&fleet)),
            fleet,
            machine: Mutex::new(machine),
            lease: Mutex::new(nonce),
            refresh: Mutex::new(None),
        }
    }

    /// Launch a new machine and wrap it.
    pub async fn launch(fleet: Arc<dyn FleetApi>, input: &LaunchInput) -> DeployResult<Self> {
        let machine = fleet.launch(input).await?;
        Ok(Self::new(fleet, machine))
    }

    #[must_use]
    pub fn id(&self) -> MachineId {
        self.machine.lock().id.clone()
    }

    /// Last known snapshot of the machine.
    #[must_use]
    pub fn machine(&self) -> Machine {
        self.machine.lock().clone()
    }

    #[must_use]
    pub fn process_group(&self) -> String {
        self.machine.lock().process_group().to_owned()
    }

    #[must_use]
    pub fn has_lease(&self) -> bool {
        self.lease.lock().is_some()
    }

    #[must_use]
    pub fn lease_nonce(&self) -> Option<String> {
        self.lease.lock().clone()
    }

    fn nonce(&self) -> DeployResult<String> {
        self.lease_nonce().ok_or_else(|| {
            DeployError::internal(format!("machine {} is not leased", self.id()))
        })
    }

    /// Take the lease unless we already hold it.
    pub async fn acquire_lease(&self, ttl: Duration) -> DeployResult<()> {
        if self.has_lease() {
            return Ok(());
        }
        let lease: Lease = self.leases.acquire(&self.id(), ttl).await?;
        *self.lease.lock() = Some(lease.nonce);
        Ok(())
    }

    /// Extend the held lease.
    pub async fn refresh_lease(&self, ttl: Duration) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.leases.refresh(&self.id(), ttl, &nonce).await?;
        Ok(())
    }

    /// Stop background refresh and give the lease back.
    pub async fn release_lease(&self, cancel: &CancellationToken) -> DeployResult<()> {
        self.stop_refresh().await;
        let Some(nonce) = self.lease.lock().take() else {
            return Ok(());
        };
        self.leases
            .release_with_grace(&self.id(), &nonce, cancel)
            .await
    }

    /// Refresh the held lease in the background until stopped or `parent` is cancelled.
    pub fn start_background_refresh(
        &self,
        ttl: Duration,
        interval: Duration,
        parent: &CancellationToken,
    ) {
        let Some(nonce) = self.lease_nonce() else {
            return;
        };
        let mut refresh = self.refresh.lock();
        if refresh.is_some() {
            return;
        }
        let cancel = parent.child_token();
        let handle =
            self.leases
                .spawn_refresh_loop(self.id(), nonce, ttl, interval, cancel.clone());
        *refresh = Some(RefreshTask { cancel, handle });
    }

    /// Stop the background refresh task and wait for it to finish.
    pub async fn stop_refresh(&self) {
        let task = self.refresh.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(machine_id = %self.id(), error = %e, "lease refresh task failed");
            }
        }
    }

    /// Apply a new configuration in place.
    pub async fn update(&self, input: &LaunchInput) -> DeployResult<()> {
        let nonce = self.nonce()?;
        let mut input = input.clone();
        input.id = Some(self.id());
        let updated = self.fleet.update(&input, Some(&nonce)).await?;
        *self.machine.lock() = updated;
        Ok(())
    }

    pub async fn start(&self) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.fleet.start(&self.id(), Some(&nonce)).await
    }

    pub async fn stop(&self) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.fleet.stop(&self.id(), Some(&nonce)).await
    }

    pub async fn cordon(&self) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.fleet.cordon(&self.id(), Some(&nonce)).await
    }

    pub async fn uncordon(&self) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.fleet.uncordon(&self.id(), Some(&nonce)).await
    }

    /// Destroy the machine. The lease goes with it.
    pub async fn destroy(&self, kill: bool) -> DeployResult<()> {
        let nonce = self.nonce()?;
        let id = self.id();
        match self.fleet.destroy(&id, kill, Some(&nonce)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(machine_id = %id, "machine already destroyed");
            }
            Err(e) => return Err(e),
        }
        self.stop_refresh().await;
        self.lease.lock().take();
        self.machine.lock().state = MachineState::Destroyed;
        Ok(())
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> DeployResult<()> {
        let nonce = self.nonce()?;
        self.fleet
            .set_metadata(&self.id(), key, value, Some(&nonce))
            .await?;
        self.machine
            .lock()
            .config
            .metadata
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    /// Re-read the machine from the fleet API.
    pub async fn refresh_state(&self) -> DeployResult<Machine> {
        let current = self.fleet.get(&self.id()).await?;
        *self.machine.lock() = current.clone();
        Ok(current)
    }

    pub async fn wait_for_state(
        &self,
        state: MachineState,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        wait::wait_for_state(self.fleet.as_ref(), &self.id(), state, timeout, false, cancel).await
    }

    pub async fn wait_for_healthy(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        wait::wait_for_healthy(self.fleet.as_ref(), &self.machine(), timeout, cancel).await
    }
}

impl std::fmt::Debug for LeasableMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasableMachine")
            .field("id", &self.id())
            .field("leased", &self.has_lease())
            .finish_non_exhaustive()
    }
}

/// The set of machines a deployment works on.
#[derive(Debug, Default)]
pub struct MachineSet {
    machines: BTreeMap<MachineId, Arc<LeasableMachine>>,
}

impl MachineSet {
    /// Wrap observed machines.
    #[must_use]
    pub fn from_machines(fleet: &Arc<dyn FleetApi>, machines: Vec<Machine>) -> Self {
        Self {
            machines: machines
                .into_iter()
                .map(|m| (m.id.clone(), Arc::new(LeasableMachine::new(Arc::clone(fleet), m))))
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &MachineId) -> Option<Arc<LeasableMachine>> {
        self.machines.get(id).cloned()
    }

    /// Handles ordered by machine ID.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<LeasableMachine>> {
        self.machines.values()
    }

    /// Current snapshots, ordered by machine ID.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Machine> {
        self.iter().map(|m| m.machine()).collect()
    }

    pub fn remove(&mut self, id: &MachineId) -> Option<Arc<LeasableMachine>> {
        self.machines.remove(id)
    }

    /// Lease every machine in the set.
    ///
    /// Every acquisition runs to completion even after one fails, so each
    /// granted lease is recorded and [`MachineSet::release_leases`] can return
    /// it. The first failure is then reported.
    pub async fn acquire_leases(&self, ttl: Duration, cancel: &CancellationToken) -> DeployResult<()> {
        let results: Vec<DeployResult<()>> = stream::iter(self.machines.values())
            .map(|machine| async move {
                if cancel.is_cancelled() {
                    return Err(DeployError::Cancelled);
                }
                machine.acquire_lease(ttl).await
            })
            .buffer_unordered(LEASE_CONCURRENCY)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Release every held lease. Failures are logged and collected.
    pub async fn release_leases(&self, cancel: &CancellationToken) -> DeployResult<()> {
        let errors: Vec<DeployError> = stream::iter(self.machines.values())
            .map(|machine| async move {
                machine.release_lease(cancel).await.map_err(|e| {
                    warn!(machine_id = %machine.id(), error = %e, "failed to release lease");
                    e
                })
            })
            .buffer_unordered(LEASE_CONCURRENCY)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeployError::Aggregate(errors))
        }
    }

    pub fn start_background_lease_refresh(
        &self,
        ttl: Duration,
        interval: Duration,
        cancel: &CancellationToken,
    ) {
        for machine in self.machines.values() {
            machine.start_background_refresh(ttl, interval, cancel);
        }
    }

    /// Stop and join every background refresh task.
    pub async fn stop_refresh(&self) {
        futures::future::join_all(self.machines.values().map(|m| m.stop_refresh())).await;
    }
}
