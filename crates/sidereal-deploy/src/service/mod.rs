//! Service lifecycle management.
//!
//! Runs one deployment with signal handling and graceful shutdown.

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::DeployConfig;
use crate::deployment::{DeploymentSummary, MachineDeployment};
use crate::error::DeployResult;
use crate::fleet::create_fleet;
use crate::plan::Manifest;
use crate::status::TracingStatus;

/// The deploy service.
///
/// Wires together:
/// - The fleet API backend
/// - The manifest of desired process groups
/// - Signal handling, which cancels the running deployment
pub struct DeployService {
    config: DeployConfig,
    cancel: CancellationToken,
}

impl DeployService {
    /// Create a new deploy service with the given configuration.
    #[must_use]
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Run one deployment.
    ///
    /// Ctrl+C or SIGTERM cancels it. Leases are still released within their
    /// grace window, so a second signal is never needed.
    pub async fn run(&self) -> DeployResult<DeploymentSummary> {
        let manifest = Manifest::from_file(&self.config.manifest)?;
        info!(
            manifest = %self.config.manifest.display(),
            image = %manifest.image,
            "manifest loaded"
        );

        let fleet = create_fleet(&self.config.fleet)?;
        info!(
            backend = ?self.config.fleet.backend,
            url = %self.config.fleet.url,
            app = %self.config.fleet.app,
            "fleet client configured"
        );

        let deployment = MachineDeployment::new(
            fleet,
            Arc::new(manifest),
            &self.config,
            Arc::new(TracingStatus),
        )?;

        let signals = tokio::spawn(shutdown_signal(self.cancel.clone()));
        let result = deployment.deploy_machines_app(&self.cancel).await;
        signals.abort();

        info!("deploy service shutdown complete");
        result
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for DeployService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, cancelling deployment");
        }
        () = terminate => {
            info!("received SIGTERM, cancelling deployment");
        }
        () = cancel.cancelled() => {
            return;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::config::FleetBackend;

    #[test]
    fn service_shutdown() {
        let service = DeployService::new(DeployConfig::default());
        assert!(!service.cancel.is_cancelled());
        service.shutdown();
        assert!(service.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn missing_manifest_is_a_config_error() {
        let mut config = DeployConfig::default();
        config.manifest = "does/not/exist.toml".into();
        let err = DeployService::new(config).run().await.unwrap_err();
        assert!(matches!(err, crate::DeployError::Config(_)));
    }

    #[tokio::test]
    async fn dry_run_against_the_mock_backend() {
        let dir = std::env::temp_dir().join(format!("sidereal-deploy-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fleet.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "image = \"registry.example.com/web:v1\"").unwrap();

        let mut config = DeployConfig::default();
        config.manifest = path;
        config.fleet.backend = FleetBackend::Mock;
        config.deploy.wait_timeout_secs = 2;

        let summary = DeployService::new(config).run().await.unwrap();
        assert_eq!(summary.created, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
