//! Core deployment orchestration logic.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::command::CommandRunner;
use crate::config::{DeployConfig, ReleaseConfig, RolloutConfig};
use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::lease::refresh_interval;
use crate::machine::MachineSet;
use crate::plan::{
    is_deployable, missing_volume, DeploymentPlan, Disposition, MachineTemplates, Planner,
    ReleaseInfo, VolumePool,
};
use crate::status::StatusSink;
use crate::strategy::{StrategyContext, UpdateEntry};
use crate::types::{LaunchInput, MachineState, ReleaseStatus};
use crate::wait::{wait_for_healthy, wait_for_state};

/// Time allowed for the final release status update once cancelled.
pub const RELEASE_STATUS_GRACE: Duration = Duration::from_secs(1);

/// What a deployment changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentSummary {
    /// Machines launched for missing capacity or new groups.
    pub created: usize,
    /// Machines updated in place.
    pub updated: usize,
    /// Machines destroyed and launched again.
    pub replaced: usize,
    /// Machines of removed groups.
    pub destroyed: usize,
    /// Machines restarted with refreshed release metadata.
    pub restarted: usize,
    /// Machines already running the desired config.
    pub unchanged: usize,
}

/// Orchestrates one deployment of an app's machines.
pub struct MachineDeployment {
    fleet: Arc<dyn FleetApi>,
    planner: Planner,
    rollout: RolloutConfig,
    release: ReleaseConfig,
    status: Arc<dyn StatusSink>,
}

impl MachineDeployment {
    /// Create a deployment. Rejects rollout settings no strategy can use.
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        templates: Arc<dyn MachineTemplates>,
        config: &DeployConfig,
        status: Arc<dyn StatusSink>,
    ) -> DeployResult<Self> {
        config.deploy.validate()?;
        Ok(Self {
            planner: Planner::new(templates, ReleaseInfo::from_config(&config.release)),
            fleet,
            rollout: config.deploy.clone(),
            release: config.release.clone(),
            status,
        })
    }

    /// Deploy the app.
    ///
    /// The stages run in order:
    /// 1. Run the release command, then the seed command
    /// 2. Lease every deployable machine and keep the leases fresh
    /// 3. Diff the machines against the templates
    /// 4. Destroy machines of removed process groups
    /// 5. Launch machines for new capacity
    /// 6. Hand the updates to the configured strategy
    /// 7. Release every lease, also after an error or a panic
    ///
    /// The release status is reported as running at the start and as
    /// complete, interrupted or failed at the end.
    pub async fn deploy_machines_app(
        &self,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentSummary> {
        info!(
            release_id = %self.release.id,
            release_version = self.release.version,
            strategy = %self.rollout.strategy,
            "starting deployment"
        );
        self.report_release_status(ReleaseStatus::Running, cancel)
            .await
            .map_err(|e| e.context("failed to set release status to 'running'"))?;

        let result = self.execute(cancel).await;

        let status = match &result {
            Ok(_) => ReleaseStatus::Complete,
            Err(e) if e.is_cancelled() => ReleaseStatus::Interrupted,
            Err(_) => ReleaseStatus::Failed,
        };
        if let Err(e) = self.report_release_status(status, cancel).await {
            warn!(release_id = %self.release.id, status = %status, error = %e, "failed to report release status");
        }

        match &result {
            Ok(summary) => info!(
                release_id = %self.release.id,
                created = summary.created,
                updated = summary.updated,
                replaced = summary.replaced,
                destroyed = summary.destroyed,
                restarted = summary.restarted,
                unchanged = summary.unchanged,
                "deployment completed successfully"
            ),
            Err(e) => {
                error!(release_id = %self.release.id, error = %e, "deployment failed");
                if let Some(suggestion) = e.suggestion() {
                    warn!("{suggestion}");
                }
            }
        }
        result
    }

    async fn execute(&self, cancel: &CancellationToken) -> DeployResult<DeploymentSummary> {
        if !self.rollout.restart_only {
            self.run_release_commands(cancel).await?;
        }
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let observed = RetryPolicy::default()
            .run("list machines", || self.fleet.list(&[]))
            .await?;
        let observed: Vec<_> = observed.into_iter().filter(is_deployable).collect();
        let machines = MachineSet::from_machines(&self.fleet, observed);
        debug!(machines = machines.len(), "loaded deployable machines");

        let result = AssertUnwindSafe(self.deploy_leased(&machines, cancel))
            .catch_unwind()
            .await;

        machines.stop_refresh().await;
        if let Err(e) = machines.release_leases(cancel).await {
            warn!(error = %e, "failed to release some leases");
        }

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn deploy_leased(
        &self,
        machines: &MachineSet,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentSummary> {
        let ttl = self.rollout.lease_timeout();
        machines
            .acquire_leases(ttl, cancel)
            .await
            .map_err(|e| e.context("failed to acquire leases"))?;
        machines.start_background_lease_refresh(ttl, refresh_interval(ttl), cancel);

        if self.rollout.restart_only {
            return self.restart(machines, cancel).await;
        }

        let snapshots = machines.snapshots();
        let volumes = RetryPolicy::default()
            .run("list volumes", || self.fleet.list_volumes())
            .await?;
        let mut volumes = VolumePool::new(volumes);
        self.planner.validate_volume_config(&snapshots, &volumes)?;
        let plan = self.planner.plan(&snapshots, &mut volumes)?;

        let mut summary = DeploymentSummary {
            updated: plan.count(Disposition::UpdateInPlace),
            replaced: plan.count(Disposition::Replace),
            unchanged: snapshots.len().saturating_sub(
                plan.count(Disposition::UpdateInPlace)
                    + plan.count(Disposition::Replace)
                    + plan.count(Disposition::Destroy),
            ),
            ..DeploymentSummary::default()
        };
        if plan.is_empty() {
            info!(machines = snapshots.len(), "machines are already up to date");
            return Ok(summary);
        }

        let groups = self.planner.resolve_process_group_changes(&snapshots);
        if !groups.removed.is_empty() || !groups.added.is_empty() {
            info!(removed = ?groups.removed, added = ?groups.added, "process groups changed");
        }

        summary.destroyed = self.destroy_stale_groups(&plan, machines).await?;
        summary.created = self.create_machines(&plan, cancel).await?;

        let entries: Vec<UpdateEntry> = plan
            .entries
            .iter()
            .filter(|e| {
                matches!(
                    e.disposition,
                    Disposition::UpdateInPlace | Disposition::Replace
                )
            })
            .filter_map(|e| {
                let old = e.old.as_ref()?;
                Some(UpdateEntry {
                    machine: machines.get(&old.id)?,
                    launch_input: e.new.clone()?,
                })
            })
            .collect();
        self.run_strategy(entries, cancel).await?;

        Ok(summary)
    }

    /// Re-apply every machine's own config with refreshed release metadata.
    async fn restart(
        &self,
        machines: &MachineSet,
        cancel: &CancellationToken,
    ) -> DeployResult<DeploymentSummary> {
        let entries: Vec<UpdateEntry> = machines
            .iter()
            .map(|machine| UpdateEntry {
                launch_input: self.planner.launch_input_for_restart(&machine.machine()),
                machine: Arc::clone(machine),
            })
            .collect();
        let restarted = entries.len();
        self.run_strategy(entries, cancel).await?;
        Ok(DeploymentSummary {
            restarted,
            ..DeploymentSummary::default()
        })
    }

    async fn run_strategy(&self, entries: Vec<UpdateEntry>, cancel: &CancellationToken) -> DeployResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ctx = StrategyContext::new(
            Arc::clone(&self.fleet),
            self.rollout.strategy_settings(),
            Arc::clone(&self.status),
        );
        let strategy = self.rollout.strategy.executor(ctx);
        info!(
            strategy = strategy.name(),
            machines = entries.len(),
            "updating machines"
        );
        strategy.apply(entries, cancel).await
    }

    async fn run_release_commands(&self, cancel: &CancellationToken) -> DeployResult<()> {
        if self.rollout.skip_release_command {
            debug!("skipping release command");
            return Ok(());
        }
        let commands = [
            (self.release.command.as_deref(), "release command"),
            (self.release.seed_command.as_deref(), "seed command"),
        ];
        if commands.iter().all(|(c, _)| c.map_or(true, <[String]>::is_empty)) {
            return Ok(());
        }

        let group = self.planner.primary_group();
        let template = self.planner.desired_config(&group)?;
        let region = self.planner.region(&group);
        let runner = CommandRunner::new(
            Arc::clone(&self.fleet),
            Arc::clone(&self.status),
            self.rollout.lease_timeout(),
        );

        for (command, what) in commands {
            let Some(command) = command.filter(|c| !c.is_empty()) else {
                continue;
            };
            info!(command = ?command, "running {what}");
            runner
                .run_once(
                    command,
                    &template,
                    &region,
                    self.rollout.release_command_timeout(),
                    cancel,
                )
                .await
                .map_err(|e| e.context(format!("{what} failed - aborting deployment")))?;
        }
        Ok(())
    }

    async fn destroy_stale_groups(&self, plan: &DeploymentPlan, machines: &MachineSet) -> DeployResult<usize> {
        let mut destroyed = 0;
        for entry in plan.with(Disposition::Destroy) {
            let Some(machine) = entry.old.as_ref().and_then(|old| machines.get(&old.id)) else {
                continue;
            };
            let id = machine.id();
            machine
                .destroy(true)
                .await
                .map_err(|e| e.context(format!("failed to destroy machine {id}")))?;
            info!(machine_id = %id, group = %machine.process_group(), "destroyed machine of removed process group");
            destroyed += 1;
        }
        Ok(destroyed)
    }

    async fn create_machines(&self, plan: &DeploymentPlan, cancel: &CancellationToken) -> DeployResult<usize> {
        let inputs: Vec<LaunchInput> = plan
            .with(Disposition::Create)
            .filter_map(|e| e.new.clone())
            .collect();
        if inputs.is_empty() {
            return Ok(0);
        }
        if self.rollout.update_only {
            info!(machines = inputs.len(), "update_only is set, not creating machines");
            return Ok(0);
        }

        let created = inputs.len();
        let results: Vec<DeployResult<()>> = stream::iter(inputs)
            .map(|input| self.create_machine(input, cancel))
            .buffer_unordered(self.rollout.max_concurrent.max(1))
            .collect()
            .await;
        results.into_iter().collect::<DeployResult<()>>()?;
        Ok(created)
    }

    async fn create_machine(&self, mut input: LaunchInput, cancel: &CancellationToken) -> DeployResult<()> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        if let Some(request) = missing_volume(&input) {
            let volume = self.fleet.create_volume(&request).await?;
            info!(volume_id = %volume.id, name = %volume.name, region = %volume.region, "created volume");
            if let Some(mount) = input.config.mounts.iter_mut().find(|m| m.volume.is_empty()) {
                mount.volume = volume.id;
            }
        }

        let machine = self.fleet.launch(&input).await?;
        info!(
            machine_id = %machine.id,
            group = %machine.process_group(),
            region = %machine.region,
            "launched machine"
        );
        if self.rollout.skip_health_checks || input.skip_launch {
            return Ok(());
        }

        let timeout = self.rollout.wait_timeout();
        wait_for_state(
            self.fleet.as_ref(),
            &machine.id,
            MachineState::Started,
            timeout,
            false,
            cancel,
        )
        .await?;
        wait_for_healthy(self.fleet.as_ref(), &machine, timeout, cancel).await
    }

    async fn report_release_status(&self, status: ReleaseStatus, cancel: &CancellationToken) -> DeployResult<()> {
        if self.release.id.is_empty() {
            return Ok(());
        }
        let update = self.fleet.update_release_status(&self.release.id, status);
        if cancel.is_cancelled() {
            tokio::time::timeout(RELEASE_STATUS_GRACE, update)
                .await
                .unwrap_or_else(|_| Err(DeployError::transient("timed out reporting release status")))
        } else {
            update.await
        }
    }
}

impl std::fmt::Debug for MachineDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineDeployment")
            .field("rollout", &self.rollout)
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fleet::{FleetCall, MockFleet};
    use crate::plan::Manifest;
    use crate::status::TracingStatus;
    use crate::types::{HostStatus, Machine, MachineConfig, MachineId, METADATA_PROCESS_GROUP};

    fn manifest(image: &str) -> Arc<Manifest> {
        Arc::new(
            Manifest::parse(&format!(
                r#"
                image = "{image}"
                primary_region = "lhr"

                [groups.app]
                count = 2
                "#
            ))
            .unwrap(),
        )
    }

    fn config() -> DeployConfig {
        let mut config = DeployConfig::default();
        config.release.id = "rel_1".to_owned();
        config.release.version = 7;
        config.deploy.wait_timeout_secs = 2;
        config
    }

    fn deployment(fleet: &Arc<MockFleet>, image: &str, config: &DeployConfig) -> MachineDeployment {
        MachineDeployment::new(fleet.clone(), manifest(image), config, Arc::new(TracingStatus)).unwrap()
    }

    fn seed(fleet: &MockFleet, id: &str, image: &str) {
        let mut config = MachineConfig {
            image: image.to_owned(),
            ..MachineConfig::default()
        };
        config
            .metadata
            .insert(METADATA_PROCESS_GROUP.to_owned(), "app".to_owned());
        fleet.insert_machine(Machine {
            id: MachineId::new(id),
            region: "lhr".to_owned(),
            state: MachineState::Started,
            config,
            host_status: HostStatus::Ok,
            checks: Vec::new(),
            events: Vec::new(),
            lease_nonce: None,
        });
    }

    #[tokio::test]
    async fn first_deploy_creates_the_group() {
        let fleet = Arc::new(MockFleet::new());
        let summary = deployment(&fleet, "app:1", &config())
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(fleet.live_machines().len(), 2);
        assert_eq!(
            fleet.release_statuses(),
            vec![
                ("rel_1".to_owned(), ReleaseStatus::Running),
                ("rel_1".to_owned(), ReleaseStatus::Complete),
            ]
        );
    }

    #[tokio::test]
    async fn second_deploy_of_the_same_release_changes_nothing() {
        let fleet = Arc::new(MockFleet::new());
        let config = config();
        deployment(&fleet, "app:1", &config)
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap();
        let calls = fleet.calls().len();

        let summary = deployment(&fleet, "app:1", &config)
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.unchanged, 2);
        let mutations = fleet.calls()[calls..]
            .iter()
            .filter(|c| !matches!(c, FleetCall::AcquireLease(_) | FleetCall::ReleaseLease(_)))
            .count();
        assert_eq!(mutations, 0);
    }

    #[tokio::test]
    async fn updates_existing_machines_and_releases_leases() {
        let fleet = Arc::new(MockFleet::new());
        seed(&fleet, "m1", "app:1");
        seed(&fleet, "m2", "app:1");

        let summary = deployment(&fleet, "app:2", &config())
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.updated, 2);
        for machine in fleet.live_machines() {
            assert_eq!(machine.image(), "app:2");
            assert!(!fleet.is_leased(&machine.id));
        }
    }

    #[tokio::test]
    async fn failed_release_command_touches_no_machine() {
        let fleet = Arc::new(MockFleet::new());
        seed(&fleet, "m1", "app:1");
        fleet.set_command_result(1, vec!["migration failed".to_owned()]);
        let mut config = config();
        config.release.command = Some(vec!["bin/migrate".to_owned()]);

        let err = deployment(&fleet, "app:2", &config)
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("release command failed"));
        assert!(!fleet
            .calls()
            .iter()
            .any(|c| matches!(c, FleetCall::AcquireLease(_) | FleetCall::Update(_))));
        assert_eq!(
            fleet.release_statuses().last().map(|(_, s)| *s),
            Some(ReleaseStatus::Failed)
        );
    }

    #[tokio::test]
    async fn cancelled_deploy_is_interrupted() {
        let fleet = Arc::new(MockFleet::new());
        seed(&fleet, "m1", "app:1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = deployment(&fleet, "app:2", &config())
            .deploy_machines_app(&cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(
            fleet.release_statuses().last().map(|(_, s)| *s),
            Some(ReleaseStatus::Interrupted)
        );
        assert!(!fleet.is_leased(&MachineId::new("m1")));
    }

    #[tokio::test]
    async fn unreported_running_status_aborts_before_any_change() {
        let fleet = Arc::new(MockFleet::new());
        seed(&fleet, "m1", "app:1");
        fleet.fail_release_status();

        let err = deployment(&fleet, "app:2", &config())
            .deploy_machines_app(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to set release status to 'running'"));
        assert!(fleet.calls().is_empty());
        assert_eq!(fleet.machine(&MachineId::new("m1")).unwrap().image(), "app:1");
    }
}
