//! Core types for sidereal-deploy.
//!
//! These mirror the fleet API's machine model. Only the fields the deployer
//! reads or writes are modelled; everything else is left to the API.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Metadata key holding a machine's process group.
pub const METADATA_PROCESS_GROUP: &str = "process_group";
/// Metadata key holding the release ID that last touched a machine.
pub const METADATA_RELEASE_ID: &str = "release_id";
/// Metadata key holding the release version that last touched a machine.
pub const METADATA_RELEASE_VERSION: &str = "release_version";
/// Metadata key holding the deployer version.
pub const METADATA_TOOL_VERSION: &str = "deploy_tool_version";
/// Metadata key holding the platform version.
pub const METADATA_PLATFORM_VERSION: &str = "platform_version";
/// Metadata key marking green machines of a blue/green deployment.
pub const METADATA_BLUEGREEN_TAG: &str = "bluegreen_deployment_tag";

/// Process group assumed for machines without a group tag.
pub const DEFAULT_PROCESS_GROUP: &str = "app";
/// Process group of release command machines.
pub const RELEASE_COMMAND_GROUP: &str = "release_command";
/// Process group of post-deploy test machines.
pub const TEST_MACHINE_GROUP: &str = "test_machine";
/// Platform version written on launch when the config carries none.
pub const DEFAULT_PLATFORM_VERSION: &str = "v2";

/// Unique identifier for a machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Create a new machine ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique machine ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for MachineId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a machine, as reported by the fleet API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Replacing,
    Destroying,
    Destroyed,
    /// Any state this crate does not know about.
    #[serde(other)]
    Unknown,
}

impl MachineState {
    /// Get the state name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::Replacing => "replacing",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the machine is gone or going away.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroying | Self::Destroyed)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reachability of the host a machine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Ok,
    Unknown,
    Unreachable,
}

/// Desired configuration of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Image reference to run.
    #[serde(default)]
    pub image: String,
    /// Command override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Free-form metadata; carries process group and release information.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Top-level health checks, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthCheck>,
    /// Services exposed by the machine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    /// Attached volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    /// Destroy the machine once its main process exits.
    #[serde(default)]
    pub auto_destroy: bool,
    /// Restart policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
}

impl MachineConfig {
    /// Process group named in the metadata, falling back to the default group.
    #[must_use]
    pub fn process_group(&self) -> &str {
        self.metadata
            .get(METADATA_PROCESS_GROUP)
            .map_or(DEFAULT_PROCESS_GROUP, String::as_str)
    }

    /// Total number of checks the deployer can gate on.
    #[must_use]
    pub fn total_checks(&self) -> usize {
        self.checks.len()
            + self
                .services
                .iter()
                .map(|s| s.checks.len())
                .sum::<usize>()
    }
}

/// Restart policy of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
}

/// A health check, either top-level or attached to a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check type (`tcp` or `http`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Port the check targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// HTTP path for `http` checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Time between check runs.
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    /// Time allowed for a single check run.
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Delay after start before probing begins.
    #[serde(default, with = "duration_opt", skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<Duration>,
}

/// A network service exposed by a machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Service {
    /// Protocol, e.g. `tcp`.
    #[serde(default)]
    pub protocol: String,
    /// Port inside the machine.
    pub internal_port: u16,
    /// Service-level checks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
    /// Commands run in test machines after this machine is updated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_checks: Vec<MachineCheck>,
}

/// A command run in a throwaway machine against a freshly updated one.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineCheck {
    /// Command to run.
    pub command: Vec<String>,
    /// Image to run it in; defaults to the target machine's image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Extra environment.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Mount {
    /// Attached volume ID; empty until a volume is chosen.
    #[serde(default)]
    pub volume: String,
    /// Mount path inside the machine.
    pub path: String,
    /// Volume name used to pick a volume.
    #[serde(default)]
    pub name: String,
    /// Size used when a volume has to be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_gb: Option<u32>,
}

/// A machine as reported by the fleet API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine ID.
    pub id: MachineId,
    /// Region the machine runs in.
    pub region: String,
    /// Lifecycle state.
    pub state: MachineState,
    /// Current configuration.
    #[serde(default)]
    pub config: MachineConfig,
    /// Reachability of the machine's host.
    #[serde(default)]
    pub host_status: HostStatus,
    /// Current check results.
    #[serde(default)]
    pub checks: Vec<CheckStatus>,
    /// Recent lifecycle events, newest last.
    #[serde(default)]
    pub events: Vec<MachineEvent>,
    /// Lease nonce, present when the response carries a lease we hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_nonce: Option<String>,
}

impl Machine {
    /// Process group this machine belongs to.
    #[must_use]
    pub fn process_group(&self) -> &str {
        self.config.process_group()
    }

    /// Image the machine currently runs.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.config.image
    }

    /// Whether the machine has at least one attached volume.
    #[must_use]
    pub fn has_mounts(&self) -> bool {
        !self.config.mounts.is_empty()
    }

    /// Summarise the current check results.
    #[must_use]
    pub fn check_summary(&self) -> CheckSummary {
        let mut summary = CheckSummary {
            total: self.checks.len(),
            ..CheckSummary::default()
        };
        for check in &self.checks {
            match check.status {
                CheckState::Passing => summary.passing += 1,
                CheckState::Warning => summary.warning += 1,
                CheckState::Critical => summary.critical += 1,
            }
        }
        summary
    }

    /// Exit code of the most recent exit that followed the most recent start.
    #[must_use]
    pub fn last_exit_code(&self) -> Option<i32> {
        let started_at = self
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Start)
            .map(|e| e.timestamp)
            .max()?;

        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Exit && e.timestamp >= started_at)
            .max_by_key(|e| e.timestamp)
            .and_then(|e| e.exit_code)
    }
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    /// Check name.
    pub name: String,
    /// Check state.
    pub status: CheckState,
    /// Last output.
    #[serde(default)]
    pub output: String,
}

/// State of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Passing,
    Warning,
    Critical,
}

/// Aggregated check results for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckSummary {
    pub total: usize,
    pub passing: usize,
    pub warning: usize,
    pub critical: usize,
}

impl CheckSummary {
    /// All checks pass and there is at least one.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.total > 0 && self.passing == self.total
    }
}

impl fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} passing", self.passing, self.total)
    }
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Launch,
    Start,
    Exit,
    Stop,
    Update,
    Destroy,
    #[serde(other)]
    Other,
}

/// A machine lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Exit code, for exit events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// A machine lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Opaque token proving ownership.
    pub nonce: String,
    /// Expiry as a unix timestamp in seconds.
    pub expires_at: i64,
    /// Holder description.
    #[serde(default)]
    pub owner: String,
}

/// A persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume ID.
    pub id: String,
    /// Volume name; several volumes may share a name.
    pub name: String,
    /// Region the volume lives in.
    pub region: String,
    /// Size in gigabytes.
    #[serde(default)]
    pub size_gb: u32,
    /// Machine the volume is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_machine_id: Option<MachineId>,
}

/// Request to create a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub region: String,
    pub size_gb: u32,
}

/// Everything needed to launch or update one machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LaunchInput {
    /// Existing machine to update; empty for launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MachineId>,
    /// Region to launch in.
    #[serde(default)]
    pub region: String,
    /// Desired configuration.
    pub config: MachineConfig,
    /// Create the machine without starting it.
    #[serde(default)]
    pub skip_launch: bool,
    /// Keep the machine out of service discovery until uncordoned.
    #[serde(default)]
    pub skip_service_registration: bool,
    /// Return the new machine already leased for this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<u64>,
    /// The update cannot be applied in place.
    #[serde(skip)]
    pub requires_replacement: bool,
}

/// Release status reported to the fleet API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Running,
    Complete,
    Interrupted,
    Failed,
}

impl ReleaseStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serde helpers for optional human-readable durations such as `"10s"`.
pub mod duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
