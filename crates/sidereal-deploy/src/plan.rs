//! Diffing the observed fleet against the desired process groups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::config::ReleaseConfig;
use crate::error::{DeployError, DeployResult};
use crate::types::{
    CreateVolumeRequest, HostStatus, LaunchInput, Machine, MachineConfig, Volume,
    DEFAULT_PLATFORM_VERSION, DEFAULT_PROCESS_GROUP, METADATA_PLATFORM_VERSION,
    METADATA_PROCESS_GROUP, METADATA_RELEASE_ID, METADATA_RELEASE_VERSION, METADATA_TOOL_VERSION,
    RELEASE_COMMAND_GROUP, TEST_MACHINE_GROUP,
};

/// Size of volumes created for new groups when the mount does not say.
pub const DEFAULT_VOLUME_SIZE_GB: u32 = 1;

/// Source of the desired machine configuration per process group.
pub trait MachineTemplates: Send + Sync {
    /// Names of the desired process groups.
    fn process_groups(&self) -> Vec<String>;

    /// Desired machine config for a group.
    fn machine_config(&self, group: &str) -> DeployResult<MachineConfig>;

    /// Number of machines the group should have.
    fn count(&self, _group: &str) -> usize {
        1
    }

    /// Region new machines of the group are placed in.
    fn region(&self, group: &str) -> String;
}

/// Desired state loaded from a TOML manifest.
///
/// ```toml
/// image = "registry.example.com/web:v42"
/// primary_region = "lhr"
///
/// [groups.app]
/// count = 2
///
/// [groups.app.config]
/// cmd = ["bin/server"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Image every group runs unless its config names another.
    #[serde(default)]
    pub image: String,

    #[serde(default = "default_region")]
    pub primary_region: String,

    #[serde(default)]
    pub groups: BTreeMap<String, GroupTemplate>,
}

/// One process group in a [`Manifest`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupTemplate {
    #[serde(default = "default_count")]
    pub count: usize,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub config: MachineConfig,
}

fn default_region() -> String {
    "iad".to_owned()
}

const fn default_count() -> usize {
    1
}

impl Manifest {
    /// Parse a manifest from TOML.
    pub fn parse(toml: &str) -> DeployResult<Self> {
        toml::from_str(toml).map_err(|e| DeployError::Config(format!("invalid manifest: {e}")))
    }

    /// Read and parse a manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> DeployResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!("failed to read manifest {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }
}

impl MachineTemplates for Manifest {
    fn process_groups(&self) -> Vec<String> {
        if self.groups.is_empty() {
            vec![DEFAULT_PROCESS_GROUP.to_owned()]
        } else {
            self.groups.keys().cloned().collect()
        }
    }

    fn machine_config(&self, group: &str) -> DeployResult<MachineConfig> {
        let mut config = match self.groups.get(group) {
            Some(template) => template.config.clone(),
            None if self.groups.is_empty() && group == DEFAULT_PROCESS_GROUP => {
                MachineConfig::default()
            }
            None => {
                return Err(DeployError::validation(format!(
                    "unknown process group '{group}'"
                )))
            }
        };
        if config.image.is_empty() {
            config.image.clone_from(&self.image);
        }
        if config.image.is_empty() {
            return Err(DeployError::validation(format!(
                "process group '{group}' has no image"
            )));
        }
        config
            .metadata
            .insert(METADATA_PROCESS_GROUP.to_owned(), group.to_owned());
        Ok(config)
    }

    fn count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(1, |g| g.count)
    }

    fn region(&self, group: &str) -> String {
        self.groups
            .get(group)
            .and_then(|g| g.region.clone())
            .unwrap_or_else(|| self.primary_region.clone())
    }
}

/// Release metadata stamped onto every machine config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub id: String,
    pub version: u64,
}

impl ReleaseInfo {
    #[must_use]
    pub fn from_config(config: &ReleaseConfig) -> Self {
        Self {
            id: config.id.clone(),
            version: config.version,
        }
    }

    /// Write release metadata into `config`, keeping an existing platform
    /// version and process group.
    pub fn apply(&self, config: &mut MachineConfig) {
        let metadata = &mut config.metadata;
        metadata.insert(METADATA_RELEASE_ID.to_owned(), self.id.clone());
        metadata.insert(METADATA_RELEASE_VERSION.to_owned(), self.version.to_string());
        metadata.insert(
            METADATA_TOOL_VERSION.to_owned(),
            env!("CARGO_PKG_VERSION").to_owned(),
        );
        metadata
            .entry(METADATA_PLATFORM_VERSION.to_owned())
            .or_insert_with(|| DEFAULT_PLATFORM_VERSION.to_owned());
        metadata
            .entry(METADATA_PROCESS_GROUP.to_owned())
            .or_insert_with(|| DEFAULT_PROCESS_GROUP.to_owned());
    }
}

/// Unattached volumes available to machines of this deployment.
#[derive(Debug, Clone, Default)]
pub struct VolumePool {
    unattached: Vec<Volume>,
}

impl VolumePool {
    #[must_use]
    pub fn new(volumes: Vec<Volume>) -> Self {
        Self {
            unattached: volumes
                .into_iter()
                .filter(|v| v.attached_machine_id.is_none())
                .collect(),
        }
    }

    /// Take an unattached volume with `name` in `region`.
    pub fn pop(&mut self, name: &str, region: &str) -> Option<Volume> {
        let index = self
            .unattached
            .iter()
            .position(|v| v.name == name && v.region == region)?;
        Some(self.unattached.remove(index))
    }

    #[must_use]
    pub fn count(&self, name: &str, region: &str) -> usize {
        self.unattached
            .iter()
            .filter(|v| v.name == name && v.region == region)
            .count()
    }
}

/// What the plan does with one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Create,
    UpdateInPlace,
    Replace,
    Destroy,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::UpdateInPlace => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// One step of a [`DeploymentPlan`].
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub old: Option<Machine>,
    pub new: Option<LaunchInput>,
    pub disposition: Disposition,
}

/// The changes that take the observed fleet to the desired one.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    pub entries: Vec<PlanEntry>,
}

impl DeploymentPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with the given disposition.
    pub fn with(&self, disposition: Disposition) -> impl Iterator<Item = &PlanEntry> {
        self.entries
            .iter()
            .filter(move |e| e.disposition == disposition)
    }

    #[must_use]
    pub fn count(&self, disposition: Disposition) -> usize {
        self.with(disposition).count()
    }
}

/// Process groups that appear or disappear in this deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessGroupsDiff {
    /// Groups with machines that are no longer desired.
    pub removed: BTreeSet<String>,
    /// Desired groups without any machine yet.
    pub added: BTreeSet<String>,
}

/// Whether a machine takes part in deployments. One-shot command machines do not.
#[must_use]
pub fn is_deployable(machine: &Machine) -> bool {
    !matches!(
        machine.process_group(),
        RELEASE_COMMAND_GROUP | TEST_MACHINE_GROUP
    )
}

/// Volume that must be created before `input` can be launched.
#[must_use]
pub fn missing_volume(input: &LaunchInput) -> Option<CreateVolumeRequest> {
    input
        .config
        .mounts
        .iter()
        .find(|m| m.volume.is_empty())
        .map(|m| CreateVolumeRequest {
            name: m.name.clone(),
            region: input.region.clone(),
            size_gb: m.size_gb.unwrap_or(DEFAULT_VOLUME_SIZE_GB),
        })
}

/// Computes launch inputs and deployment plans.
#[derive(Clone)]
pub struct Planner {
    templates: Arc<dyn MachineTemplates>,
    release: ReleaseInfo,
}

impl Planner {
    #[must_use]
    pub fn new(templates: Arc<dyn MachineTemplates>, release: ReleaseInfo) -> Self {
        Self { templates, release }
    }

    /// Desired config for a group with release metadata applied.
    pub fn desired_config(&self, group: &str) -> DeployResult<MachineConfig> {
        let mut config = self.templates.machine_config(group)?;
        config
            .metadata
            .insert(METADATA_PROCESS_GROUP.to_owned(), group.to_owned());
        self.release.apply(&mut config);
        Ok(config)
    }

    /// The group release commands borrow their config from.
    #[must_use]
    pub fn primary_group(&self) -> String {
        let groups = self.templates.process_groups();
        if groups.iter().any(|g| g == DEFAULT_PROCESS_GROUP) {
            return DEFAULT_PROCESS_GROUP.to_owned();
        }
        groups
            .into_iter()
            .next()
            .unwrap_or_else(|| DEFAULT_PROCESS_GROUP.to_owned())
    }

    #[must_use]
    pub fn region(&self, group: &str) -> String {
        self.templates.region(group)
    }

    pub fn resolve_process_group_changes(&self, observed: &[Machine]) -> ProcessGroupsDiff {
        let existing: BTreeSet<String> = observed
            .iter()
            .filter(|m| is_deployable(m))
            .map(|m| m.process_group().to_owned())
            .collect();
        let desired: BTreeSet<String> = self.templates.process_groups().into_iter().collect();

        ProcessGroupsDiff {
            removed: existing.difference(&desired).cloned().collect(),
            added: desired.difference(&existing).cloned().collect(),
        }
    }

    /// Compare the observed machines against the templates.
    ///
    /// Machines whose rendered config already matches are left out, so a
    /// converged fleet yields an empty plan.
    pub fn plan(&self, observed: &[Machine], volumes: &mut VolumePool) -> DeployResult<DeploymentPlan> {
        let mut by_group: BTreeMap<&str, Vec<&Machine>> = BTreeMap::new();
        for machine in observed.iter().filter(|m| is_deployable(m)) {
            by_group
                .entry(machine.process_group())
                .or_default()
                .push(machine);
        }
        for machines in by_group.values_mut() {
            machines.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let desired = self.templates.process_groups();
        let mut entries = Vec::new();

        for (group, machines) in &by_group {
            if desired.iter().any(|g| g.as_str() == *group) {
                continue;
            }
            entries.extend(machines.iter().map(|m| PlanEntry {
                old: Some((*m).clone()),
                new: None,
                disposition: Disposition::Destroy,
            }));
        }

        for group in &desired {
            let machines = by_group.get(group.as_str()).map_or(&[][..], Vec::as_slice);

            for machine in machines {
                let input = self.launch_input_for_update(machine, volumes)?;
                let disposition = if input.requires_replacement {
                    Disposition::Replace
                } else if input.config != machine.config {
                    Disposition::UpdateInPlace
                } else {
                    continue;
                };
                entries.push(PlanEntry {
                    old: Some((*machine).clone()),
                    new: Some(input),
                    disposition,
                });
            }

            let shortfall = self.templates.count(group).saturating_sub(machines.len());
            for _ in 0..shortfall {
                entries.push(PlanEntry {
                    old: None,
                    new: Some(self.launch_input_for_launch(group, volumes)?),
                    disposition: Disposition::Create,
                });
            }
        }

        Ok(DeploymentPlan { entries })
    }

    /// Launch input for a new machine in `group`.
    ///
    /// When no unattached volume is available the mount is left without a
    /// volume ID; see [`missing_volume`].
    pub fn launch_input_for_launch(
        &self,
        group: &str,
        volumes: &mut VolumePool,
    ) -> DeployResult<LaunchInput> {
        let mut config = self.desired_config(group)?;
        let region = self.templates.region(group);

        if let Some(mount) = config.mounts.first_mut() {
            if let Some(volume) = volumes.pop(&mount.name, &region) {
                mount.volume = volume.id;
            }
        }

        Ok(LaunchInput {
            region,
            config,
            ..LaunchInput::default()
        })
    }

    /// Launch input that converges an existing machine to its group's config.
    ///
    /// Volumes cannot be swapped on a running machine, so any mount change
    /// other than the path forces a replacement. So does an unhealthy host.
    pub fn launch_input_for_update(
        &self,
        machine: &Machine,
        volumes: &mut VolumePool,
    ) -> DeployResult<LaunchInput> {
        let group = machine.process_group().to_owned();
        let mut config = self.desired_config(&group)?;
        let mut replace = machine.host_status != HostStatus::Ok;

        let old_mounts = &machine.config.mounts;
        match (old_mounts.first(), config.mounts.first_mut()) {
            (Some(_), None) => {
                warn!(
                    machine_id = %machine.id,
                    "machine has a volume attached but its group has no mounts"
                );
                replace = true;
            }
            (Some(old), Some(new)) if old.name.is_empty() => {
                *new = old.clone();
            }
            (Some(old), Some(new)) if old.name != new.name => {
                warn!(
                    machine_id = %machine.id,
                    attached = %old.name,
                    wanted = %new.name,
                    "machine has a different volume attached than its group wants"
                );
                let volume = volumes.pop(&new.name, &machine.region).ok_or_else(|| {
                    DeployError::validation(format!(
                        "machine in group '{group}' needs an unattached volume named '{}' in region '{}'",
                        new.name, machine.region
                    ))
                })?;
                new.volume = volume.id;
                replace = true;
            }
            (Some(old), Some(new)) => {
                if old.path != new.path {
                    warn!(
                        machine_id = %machine.id,
                        volume = %old.volume,
                        from = %old.path,
                        to = %new.path,
                        "updating volume mount path"
                    );
                    new.volume.clone_from(&old.volume);
                    new.size_gb = old.size_gb;
                } else {
                    *new = old.clone();
                }
            }
            (None, Some(new)) => {
                let volume = volumes.pop(&new.name, &machine.region).ok_or_else(|| {
                    DeployError::validation(format!(
                        "machine in group '{group}' needs an unattached volume named '{}' in region '{}'",
                        new.name, machine.region
                    ))
                })?;
                new.volume = volume.id;
                replace = true;
            }
            (None, None) => {}
        }

        if machine.host_status != HostStatus::Ok {
            if let (Some(old), Some(new)) = (old_mounts.first(), config.mounts.first()) {
                if old.volume == new.volume {
                    return Err(DeployError::validation(format!(
                        "machine '{}' requires manual intervention, it can't be automatically replaced because its volume '{}' is on an unreachable host",
                        machine.id, old.volume
                    )));
                }
            }
        }

        Ok(LaunchInput {
            id: Some(machine.id.clone()),
            region: machine.region.clone(),
            config,
            requires_replacement: replace,
            ..LaunchInput::default()
        })
    }

    /// Launch input that keeps a machine's config and refreshes its release metadata.
    #[must_use]
    pub fn launch_input_for_restart(&self, machine: &Machine) -> LaunchInput {
        let mut config = machine.config.clone();
        self.release.apply(&mut config);
        LaunchInput {
            id: Some(machine.id.clone()),
            region: machine.region.clone(),
            config,
            ..LaunchInput::default()
        }
    }

    /// Check that every existing machine's volume can follow its group's mounts.
    pub fn validate_volume_config(
        &self,
        observed: &[Machine],
        volumes: &VolumePool,
    ) -> DeployResult<()> {
        for group in self.templates.process_groups() {
            let machines: Vec<&Machine> = observed
                .iter()
                .filter(|m| is_deployable(m) && m.process_group() == group)
                .collect();
            if machines.is_empty() {
                continue;
            }

            let config = self.templates.machine_config(&group)?;
            let wanted = config.mounts.first();
            let mut needs: BTreeMap<&str, usize> = BTreeMap::new();

            for machine in &machines {
                let attached = machine.config.mounts.first();
                match (attached, wanted) {
                    (Some(_), None) => {
                        return Err(DeployError::validation(format!(
                            "machine {} [{group}] has a volume mounted but the group config does not specify one; \
                             remove the volume from the machine or add a mount to the group",
                            machine.id
                        )));
                    }
                    (Some(old), Some(new)) if !old.name.is_empty() && old.name != new.name => {
                        return Err(DeployError::validation(format!(
                            "machine {} [{group}] can't update the attached volume {} with name '{}' by '{}'",
                            machine.id, old.volume, old.name, new.name
                        )));
                    }
                    (None, Some(_)) => *needs.entry(machine.region.as_str()).or_default() += 1,
                    _ => {}
                }
            }

            if let Some(mount) = wanted {
                let missing: Vec<String> = needs
                    .iter()
                    .filter_map(|(region, &need)| {
                        let short = need.saturating_sub(volumes.count(&mount.name, region));
                        (short > 0).then(|| format!("{region}={short}"))
                    })
                    .collect();
                if !missing.is_empty() {
                    return Err(DeployError::validation(format!(
                        "process group '{group}' needs volumes with name '{}' to fulfill its mounts; \
                         create them in the following regions and counts: {}",
                        mount.name,
                        missing.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planner")
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}
