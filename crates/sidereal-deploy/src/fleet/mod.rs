//! Boundary to the remote fleet-management API.
//!
//! The fleet API owns all machine state. [`FleetApi`] is the narrow set of
//! calls the deployer needs; [`FleetClient`] speaks it over HTTP and
//! [`MockFleet`] keeps an in-memory fleet for tests and dry runs.

mod client;
mod mock;

pub use client::FleetClient;
pub use mock::{FleetCall, MockFleet, UpdateFault};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{FleetBackend, FleetConfig};
use crate::error::DeployResult;
use crate::types::{
    CreateVolumeRequest, LaunchInput, Lease, Machine, MachineId, MachineState, ReleaseStatus,
    Volume,
};

/// Operations offered by the fleet API.
///
/// Mutating calls take the caller's lease nonce. Implementations report
/// failures already classified: conflicts as
/// [`DeployError::LeaseConflict`](crate::DeployError::LeaseConflict),
/// capacity problems as [`DeployError::Placement`](crate::DeployError::Placement)
/// and temporary failures as [`DeployError::Transient`](crate::DeployError::Transient).
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Create (and, unless `skip_launch`, start) a machine.
    async fn launch(&self, input: &LaunchInput) -> DeployResult<Machine>;

    /// Replace the configuration of an existing machine.
    async fn update(&self, input: &LaunchInput, nonce: Option<&str>) -> DeployResult<Machine>;

    /// Start a stopped machine.
    async fn start(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()>;

    /// Stop a running machine.
    async fn stop(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()>;

    /// Take a machine out of service discovery.
    async fn cordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()>;

    /// Put a machine back into service discovery.
    async fn uncordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()>;

    /// Destroy a machine, optionally killing it first.
    async fn destroy(&self, id: &MachineId, kill: bool, nonce: Option<&str>) -> DeployResult<()>;

    /// List machines. An empty state filter lists every machine that is not destroyed.
    async fn list(&self, states: &[MachineState]) -> DeployResult<Vec<Machine>>;

    /// Fetch one machine.
    async fn get(&self, id: &MachineId) -> DeployResult<Machine>;

    /// Take a lease on a machine.
    async fn acquire_lease(&self, id: &MachineId, ttl_secs: u64) -> DeployResult<Lease>;

    /// Extend a lease we hold.
    async fn refresh_lease(&self, id: &MachineId, ttl_secs: u64, nonce: &str)
        -> DeployResult<Lease>;

    /// Give a lease back.
    async fn release_lease(&self, id: &MachineId, nonce: &str) -> DeployResult<()>;

    /// Block until the machine reaches `state` or `timeout` elapses.
    ///
    /// A timeout is reported as a transient error.
    async fn wait(&self, id: &MachineId, state: MachineState, timeout: Duration)
        -> DeployResult<()>;

    /// Set one metadata key on a machine.
    async fn set_metadata(
        &self,
        id: &MachineId,
        key: &str,
        value: &str,
        nonce: Option<&str>,
    ) -> DeployResult<()>;

    /// List the app's volumes.
    async fn list_volumes(&self) -> DeployResult<Vec<Volume>>;

    /// Create a volume.
    async fn create_volume(&self, request: &CreateVolumeRequest) -> DeployResult<Volume>;

    /// Fetch the most recent log lines of a machine.
    async fn logs(&self, id: &MachineId, limit: usize) -> DeployResult<Vec<String>>;

    /// Record the status of a release.
    async fn update_release_status(
        &self,
        release_id: &str,
        status: ReleaseStatus,
    ) -> DeployResult<()>;
}

/// Create a fleet backend from configuration.
pub fn create_fleet(config: &FleetConfig) -> DeployResult<Arc<dyn FleetApi>> {
    match config.backend {
        FleetBackend::Http => Ok(Arc::new(FleetClient::new(config)?)),
        FleetBackend::Mock => Ok(Arc::new(MockFleet::new())),
    }
}
