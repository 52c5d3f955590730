//! Per-machine mutual exclusion leases.
//!
//! A machine is only mutated while the caller holds its lease. Leases expire
//! on the server after their TTL, so anything held across long waits is
//! refreshed in the background by [`LeaseManager::spawn_refresh_loop`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::types::{Lease, MachineId};

/// Lease TTL used when none is configured.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(13);

/// How long a release may take once the deployment has been cancelled.
pub const LEASE_RELEASE_GRACE: Duration = Duration::from_millis(500);

const REFRESH_JITTER: Duration = Duration::from_millis(20);

/// Default refresh interval for a TTL: a third of the TTL less one second.
#[must_use]
pub fn refresh_interval(ttl: Duration) -> Duration {
    (ttl.saturating_sub(Duration::from_secs(1)) / 3).max(Duration::from_millis(100))
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Acquires, refreshes and releases machine leases.
#[derive(Clone)]
pub struct LeaseManager {
    fleet: Arc<dyn FleetApi>,
}

impl LeaseManager {
    /// Create a lease manager talking to `fleet`.
    #[must_use]
    pub fn new(fleet: Arc<dyn FleetApi>) -> Self {
        Self { fleet }
    }

    /// Take the lease on a machine.
    ///
    /// A lease held by someone else fails fast with
    /// [`DeployError::LeaseConflict`]; it is never retried.
    pub async fn acquire(&self, machine_id: &MachineId, ttl: Duration) -> DeployResult<Lease> {
        let lease = self.fleet.acquire_lease(machine_id, ttl_secs(ttl)).await?;
        debug!(machine_id = %machine_id, expires_at = lease.expires_at, "lease acquired");
        Ok(lease)
    }

    /// Give a lease back. Releasing an absent lease, or one that lapsed and
    /// now belongs to someone else, succeeds.
    pub async fn release(&self, machine_id: &MachineId, nonce: &str) -> DeployResult<()> {
        if nonce.is_empty() {
            return Ok(());
        }

        match self.fleet.release_lease(machine_id, nonce).await {
            Ok(()) => {
                debug!(machine_id = %machine_id, "lease released");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(machine_id = %machine_id, "lease already gone");
                Ok(())
            }
            Err(DeployError::LeaseConflict { message, .. }) => {
                debug!(machine_id = %machine_id, holder = %message, "lease expired and was taken by another holder");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lease, bounding the call by [`LEASE_RELEASE_GRACE`] once
    /// `cancel` has fired.
    pub async fn release_with_grace(
        &self,
        machine_id: &MachineId,
        nonce: &str,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        if !cancel.is_cancelled() {
            return self.release(machine_id, nonce).await;
        }

        tokio::time::timeout(LEASE_RELEASE_GRACE, self.release(machine_id, nonce))
            .await
            .unwrap_or_else(|_| {
                Err(DeployError::transient(format!(
                    "timed out releasing lease on machine {machine_id}"
                )))
            })
    }

    /// Extend a lease we hold.
    pub async fn refresh(
        &self,
        machine_id: &MachineId,
        ttl: Duration,
        nonce: &str,
    ) -> DeployResult<Lease> {
        let lease = self
            .fleet
            .refresh_lease(machine_id, ttl_secs(ttl), nonce)
            .await?;

        if lease.nonce != nonce {
            return Err(DeployError::LeaseConflict {
                machine_id: machine_id.clone(),
                message: format!("lease was taken over by {}", lease.owner),
            });
        }
        Ok(lease)
    }

    /// Keep a lease alive until `cancel` fires or the machine disappears.
    ///
    /// Refreshes run every `interval`, give or take a few milliseconds of
    /// jitter. Other refresh failures are logged and retried on the next tick.
    pub fn spawn_refresh_loop(
        &self,
        machine_id: MachineId,
        nonce: String,
        ttl: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..=REFRESH_JITTER * 2);
                let delay = (interval + jitter).saturating_sub(REFRESH_JITTER);

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                match manager.refresh(&machine_id, ttl, &nonce).await {
                    Ok(lease) => {
                        debug!(machine_id = %machine_id, expires_at = lease.expires_at, "lease refreshed");
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(machine_id = %machine_id, "machine gone, stopping lease refresh");
                        break;
                    }
                    Err(e) => {
                        warn!(machine_id = %machine_id, error = %e, "failed to refresh lease");
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fleet::{FleetCall, MockFleet};
    use crate::types::{LaunchInput, MachineConfig};

    async fn fleet_with_machine() -> (Arc<MockFleet>, MachineId) {
        let fleet = Arc::new(MockFleet::new());
        let machine = fleet
            .launch(&LaunchInput {
                region: "lhr".to_owned(),
                config: MachineConfig::default(),
                ..LaunchInput::default()
            })
            .await
            .unwrap();
        (fleet, machine.id)
    }

    #[test]
    fn refresh_interval_is_a_third_of_ttl() {
        assert_eq!(refresh_interval(DEFAULT_LEASE_TTL), Duration::from_secs(4));
        assert_eq!(
            refresh_interval(Duration::from_secs(1)),
            Duration::from_millis(100)
        );
    }

    #[tokio::test]
    async fn second_holder_gets_conflict() {
        let (fleet, id) = fleet_with_machine().await;
        let leases = LeaseManager::new(fleet.clone());

        let lease = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();
        let err = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap_err();
        assert!(matches!(err, DeployError::LeaseConflict { .. }));
        assert!(err.is_unrecoverable());

        leases.release(&id, &lease.nonce).await.unwrap();
        leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (fleet, id) = fleet_with_machine().await;
        let leases = LeaseManager::new(fleet.clone());

        leases.release(&id, "").await.unwrap();
        let lease = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();
        leases.release(&id, &lease.nonce).await.unwrap();
        leases.release(&id, &lease.nonce).await.unwrap();
        assert!(!fleet.is_leased(&id));

        let releases = fleet
            .calls()
            .into_iter()
            .filter(|c| matches!(c, FleetCall::ReleaseLease(_)))
            .count();
        assert_eq!(releases, 2);
    }

    #[tokio::test]
    async fn release_of_a_lapsed_lease_taken_by_another_holder_succeeds() {
        let (fleet, id) = fleet_with_machine().await;
        let leases = LeaseManager::new(fleet.clone());

        let ours = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();
        fleet.hold_lease(&id, "other-holder");

        leases.release(&id, &ours.nonce).await.unwrap();
        assert!(fleet.is_leased(&id));
    }

    #[tokio::test]
    async fn release_after_cancel_still_happens() {
        let (fleet, id) = fleet_with_machine().await;
        let leases = LeaseManager::new(fleet.clone());
        let lease = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        leases
            .release_with_grace(&id, &lease.nonce, &cancel)
            .await
            .unwrap();
        assert!(!fleet.is_leased(&id));
    }

    #[tokio::test]
    async fn refresh_with_foreign_nonce_conflicts() {
        let (fleet, id) = fleet_with_machine().await;
        fleet.hold_lease(&id, "someone-else");
        let leases = LeaseManager::new(fleet);

        let err = leases
            .refresh(&id, DEFAULT_LEASE_TTL, "not-ours")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::LeaseConflict { .. }));
    }

    #[tokio::test]
    async fn refresh_loop_stops_on_cancel() {
        let (fleet, id) = fleet_with_machine().await;
        let leases = LeaseManager::new(fleet.clone());
        let lease = leases.acquire(&id, DEFAULT_LEASE_TTL).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = leases.spawn_refresh_loop(
            id.clone(),
            lease.nonce.clone(),
            DEFAULT_LEASE_TTL,
            Duration::from_millis(30),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(fleet.is_leased(&id));
    }
}
