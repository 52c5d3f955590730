//! Common test utilities for deployment integration tests.

pub mod fixtures;

use std::sync::Arc;

use sidereal_deploy::{
    DeployConfig, DeployResult, DeploymentStrategy, DeploymentSummary, MachineDeployment,
    Manifest, MockFleet, TracingStatus,
};
use tokio_util::sync::CancellationToken;

/// A mock fleet plus the configuration deployments against it run with.
pub struct TestFleet {
    pub fleet: Arc<MockFleet>,
    pub config: DeployConfig,
}

impl TestFleet {
    /// Creates an empty fleet with short timeouts and no blue/green pauses.
    pub fn new() -> Self {
        let mut config = DeployConfig::default();
        config.release.id = "rel_test".to_owned();
        config.release.version = 1;
        config.deploy.wait_timeout_secs = 2;
        config.deploy.bluegreen.cordon_delay_secs = 0;
        config.deploy.bluegreen.stop_delay_secs = 0;

        Self {
            fleet: Arc::new(MockFleet::new()),
            config,
        }
    }

    /// Creates an empty fleet deploying with `strategy`.
    pub fn with_strategy(strategy: DeploymentStrategy) -> Self {
        let mut test = Self::new();
        test.config.deploy.strategy = strategy;
        test
    }

    /// Builds a deployment of `manifest` against this fleet.
    pub fn deployment(&self, manifest: Manifest) -> MachineDeployment {
        MachineDeployment::new(
            self.fleet.clone(),
            Arc::new(manifest),
            &self.config,
            Arc::new(TracingStatus),
        )
        .unwrap()
    }

    /// Runs one deployment of `manifest` to completion.
    pub async fn deploy(&self, manifest: Manifest) -> DeployResult<DeploymentSummary> {
        self.deployment(manifest)
            .deploy_machines_app(&CancellationToken::new())
            .await
    }

    /// Images of every live machine, sorted.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .fleet
            .live_machines()
            .iter()
            .map(|m| m.image().to_owned())
            .collect();
        images.sort();
        images
    }

    /// Whether any live machine is still leased.
    pub fn any_leased(&self) -> bool {
        self.fleet
            .live_machines()
            .iter()
            .any(|m| self.fleet.is_leased(&m.id))
    }
}

impl Default for TestFleet {
    fn default() -> Self {
        Self::new()
    }
}
