//! Sidereal deploy binary.
//!
//! Deploys the machines described by the configured manifest.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sidereal_deploy::{DeployConfig, DeployService};

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sidereal_deploy=info".parse()?),
        )
        .init();

    info!("Sidereal deploy starting");

    let config = DeployConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        DeployConfig::default()
    });

    info!(
        fleet = %config.fleet.url,
        app = %config.fleet.app,
        strategy = %config.deploy.strategy,
        release = %config.release.id,
        "configuration loaded"
    );

    match DeployService::new(config).run().await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "deployment did not complete");
            Ok(ExitCode::FAILURE)
        }
    }
}
