//! Configuration for sidereal-deploy.

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{DeployError, DeployResult};
use crate::strategy::{DeploymentStrategy, StrategySettings};

/// Top-level configuration for a deployment run.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Fleet API connection.
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Rollout behaviour.
    #[serde(default)]
    pub deploy: RolloutConfig,

    /// Release being deployed.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Path to the manifest describing the desired process groups.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("fleet.toml")
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            fleet: FleetConfig::default(),
            deploy: RolloutConfig::default(),
            release: ReleaseConfig::default(),
            manifest: default_manifest(),
        }
    }
}

impl DeployConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `deploy.toml` in the current directory (if present)
    /// 3. Environment variables with `SIDEREAL_DEPLOY_` prefix
    pub fn load() -> DeployResult<Self> {
        Self::from_file("deploy.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> DeployResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SIDEREAL_DEPLOY_").split("__"))
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))?;
        config.deploy.validate()?;
        Ok(config)
    }
}

/// Fleet API connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Base URL of the fleet API.
    #[serde(default = "default_fleet_url")]
    pub url: String,

    /// Application whose machines are deployed.
    #[serde(default)]
    pub app: String,

    /// Bearer token.
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_fleet_timeout_secs")]
    pub timeout_secs: u64,

    /// Which backend to talk to.
    #[serde(default)]
    pub backend: FleetBackend,
}

fn default_fleet_url() -> String {
    "http://localhost:4280/v1".to_owned()
}

const fn default_fleet_timeout_secs() -> u64 {
    // Long enough for a 60s server-side wait.
    90
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            url: default_fleet_url(),
            app: String::new(),
            token: None,
            timeout_secs: default_fleet_timeout_secs(),
            backend: FleetBackend::default(),
        }
    }
}

/// Fleet API backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetBackend {
    /// Remote HTTP API.
    #[default]
    Http,

    /// In-memory fleet, for dry runs.
    Mock,
}

/// Rollout behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RolloutConfig {
    /// Strategy used to apply updates.
    #[serde(default)]
    pub strategy: DeploymentStrategy,

    /// Machines per group updated at once; a fraction in (0, 1) is a share of the group.
    #[serde(default = "default_max_unavailable")]
    pub max_unavailable: f64,

    /// Upper bound on parallel machine operations outside rolling waves.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long to wait for a machine to start or become healthy.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,

    /// Lease TTL for machines held during the deployment.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    /// How long the release command may run.
    #[serde(default = "default_release_command_timeout_secs")]
    pub release_command_timeout_secs: u64,

    /// Do not wait for machines to start or pass health checks.
    #[serde(default)]
    pub skip_health_checks: bool,

    /// Do not run the release command.
    #[serde(default)]
    pub skip_release_command: bool,

    /// Only refresh release metadata on existing machines.
    #[serde(default)]
    pub restart_only: bool,

    /// Never create machines for new process groups.
    #[serde(default)]
    pub update_only: bool,

    /// Extra attempts for a machine whose update failed.
    #[serde(default)]
    pub deploy_retries: u32,

    /// Fail the deployment when a post-update machine check fails.
    #[serde(default = "default_true")]
    pub machine_checks_fatal: bool,

    /// Blue/green pacing.
    #[serde(default)]
    pub bluegreen: BlueGreenConfig,
}

const fn default_max_unavailable() -> f64 {
    0.33
}

const fn default_max_concurrent() -> usize {
    8
}

const fn default_wait_timeout_secs() -> u64 {
    300 // 5 minutes
}

const fn default_lease_timeout_secs() -> u64 {
    13
}

const fn default_release_command_timeout_secs() -> u64 {
    300 // 5 minutes
}

const fn default_true() -> bool {
    true
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            strategy: DeploymentStrategy::default(),
            max_unavailable: default_max_unavailable(),
            max_concurrent: default_max_concurrent(),
            wait_timeout_secs: default_wait_timeout_secs(),
            lease_timeout_secs: default_lease_timeout_secs(),
            release_command_timeout_secs: default_release_command_timeout_secs(),
            skip_health_checks: false,
            skip_release_command: false,
            restart_only: false,
            update_only: false,
            deploy_retries: 0,
            machine_checks_fatal: true,
            bluegreen: BlueGreenConfig::default(),
        }
    }
}

impl RolloutConfig {
    /// Reject settings no strategy can work with.
    pub fn validate(&self) -> DeployResult<()> {
        if !self.max_unavailable.is_finite() || self.max_unavailable <= 0.0 {
            return Err(DeployError::validation(format!(
                "invalid max_unavailable value {}: must be a fraction in (0, 1) or a count of at least 1",
                self.max_unavailable
            )));
        }
        if self.lease_timeout_secs < 2 {
            return Err(DeployError::validation(
                "lease_timeout_secs must be at least 2 seconds",
            ));
        }
        Ok(())
    }

    /// Wait timeout as a duration.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Lease TTL as a duration.
    #[must_use]
    pub const fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Release command timeout as a duration.
    #[must_use]
    pub const fn release_command_timeout(&self) -> Duration {
        Duration::from_secs(self.release_command_timeout_secs)
    }

    /// Settings handed to the strategy executors.
    #[must_use]
    pub fn strategy_settings(&self) -> StrategySettings {
        StrategySettings {
            max_unavailable: self.max_unavailable,
            max_concurrent: self.max_concurrent,
            wait_timeout: self.wait_timeout(),
            lease_ttl: self.lease_timeout(),
            skip_health_checks: self.skip_health_checks,
            deploy_retries: self.deploy_retries,
            machine_checks_fatal: self.machine_checks_fatal,
            cordon_delay: Duration::from_secs(self.bluegreen.cordon_delay_secs),
            stop_delay: Duration::from_secs(self.bluegreen.stop_delay_secs),
        }
    }
}

/// Blue/green pacing between cutting traffic over and removing blue machines.
#[derive(Debug, Clone, Deserialize)]
pub struct BlueGreenConfig {
    /// Pause after green is serving, before blue is cordoned.
    #[serde(default = "default_bluegreen_delay_secs")]
    pub cordon_delay_secs: u64,

    /// Pause after blue is cordoned, before it is stopped.
    #[serde(default = "default_bluegreen_delay_secs")]
    pub stop_delay_secs: u64,
}

const fn default_bluegreen_delay_secs() -> u64 {
    10
}

impl Default for BlueGreenConfig {
    fn default() -> Self {
        Self {
            cordon_delay_secs: default_bluegreen_delay_secs(),
            stop_delay_secs: default_bluegreen_delay_secs(),
        }
    }
}

/// The release being deployed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseConfig {
    /// Release identifier recorded on machines and reported to the fleet API.
    #[serde(default)]
    pub id: String,

    /// Release version number.
    #[serde(default)]
    pub version: u64,

    /// Command run once before any machine is touched.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Command run once after the release command succeeds.
    #[serde(default)]
    pub seed_command: Option<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DeployConfig::default();
        assert_eq!(config.deploy.strategy, DeploymentStrategy::Rolling);
        assert!((config.deploy.max_unavailable - 0.33).abs() < f64::EPSILON);
        assert_eq!(config.deploy.wait_timeout(), Duration::from_secs(300));
        assert_eq!(config.deploy.lease_timeout(), Duration::from_secs(13));
        assert_eq!(config.fleet.backend, FleetBackend::Http);
        assert!(config.deploy.validate().is_ok());
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            manifest = "apps/web.toml"

            [fleet]
            url = "https://fleet.internal/v1"
            app = "web"

            [deploy]
            strategy = "bluegreen"
            max_unavailable = 2
            skip_health_checks = true

            [deploy.bluegreen]
            cordon_delay_secs = 0

            [release]
            id = "rel_01"
            version = 42
            command = ["bin/migrate"]
        "#;

        let config: DeployConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.manifest, PathBuf::from("apps/web.toml"));
        assert_eq!(config.fleet.app, "web");
        assert_eq!(config.deploy.strategy, DeploymentStrategy::BlueGreen);
        assert!((config.deploy.max_unavailable - 2.0).abs() < f64::EPSILON);
        assert!(config.deploy.skip_health_checks);
        assert_eq!(config.deploy.bluegreen.cordon_delay_secs, 0);
        assert_eq!(config.deploy.bluegreen.stop_delay_secs, 10);
        assert_eq!(config.release.version, 42);
        assert_eq!(config.release.command, Some(vec!["bin/migrate".to_owned()]));
    }

    #[test]
    fn rejects_non_positive_max_unavailable() {
        let rollout = RolloutConfig {
            max_unavailable: 0.0,
            ..RolloutConfig::default()
        };
        let err = rollout.validate().unwrap_err();
        assert!(err.to_string().contains("max_unavailable"));
    }

    #[test]
    fn strategy_settings_carry_durations() {
        let rollout = RolloutConfig {
            wait_timeout_secs: 30,
            ..RolloutConfig::default()
        };
        let settings = rollout.strategy_settings();
        assert_eq!(settings.wait_timeout, Duration::from_secs(30));
        assert_eq!(settings.cordon_delay, Duration::from_secs(10));
        assert!(settings.machine_checks_fatal);
    }
}
