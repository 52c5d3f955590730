//! One-shot command machines: release commands and machine checks.
//!
//! A command runs in an auto-destroying machine. The runner waits for the
//! machine to start and then to be destroyed, and reads the exit code from
//! the newest `exit` event that follows the newest `start` event.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::lease::LeaseManager;
use crate::status::{LineStatus, StatusSink};
use crate::types::{
    LaunchInput, Machine, MachineConfig, MachineState, RestartPolicy, METADATA_PROCESS_GROUP,
    RELEASE_COMMAND_GROUP, TEST_MACHINE_GROUP,
};
use crate::wait::wait_for_state;

/// Log lines attached to a failed command.
pub const COMMAND_LOG_LINES: usize = 100;

/// Environment variable set for release commands.
pub const RELEASE_COMMAND_ENV: &str = "RELEASE_COMMAND";

/// Environment variable naming the machine a check runs against.
pub const CHECK_TARGET_ENV: &str = "TARGET_MACHINE_ID";

/// Runs commands in short-lived machines.
#[derive(Clone)]
pub struct CommandRunner {
    fleet: Arc<dyn FleetApi>,
    leases: LeaseManager,
    status: Arc<dyn StatusSink>,
    lease_ttl: Duration,
}

impl CommandRunner {
    #[must_use]
    pub fn new(fleet: Arc<dyn FleetApi>, status: Arc<dyn StatusSink>, lease_ttl: Duration) -> Self {
        Self {
            leases: LeaseManager::new(Arc::clone(&fleet)),
            fleet,
            status,
            lease_ttl,
        }
    }

    /// Run a release command once and return its exit code.
    ///
    /// Release-command machines left over from earlier runs are destroyed
    /// first. A non-zero exit fails with [`DeployError::CommandFailed`].
    pub async fn run_once(
        &self,
        command: &[String],
        template: &MachineConfig,
        region: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DeployResult<i32> {
        self.destroy_stale(RELEASE_COMMAND_GROUP).await;

        let mut config = command_config(template, command, RELEASE_COMMAND_GROUP);
        config
            .env
            .insert(RELEASE_COMMAND_ENV.to_owned(), "1".to_owned());
        self.run_machine(config, region, timeout, cancel, "release command")
            .await
    }

    /// Run every machine check declared on the machine's services.
    ///
    /// Stops at the first failing check.
    pub async fn run_machine_checks(
        &self,
        machine: &Machine,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        let checks = machine
            .config
            .services
            .iter()
            .flat_map(|s| s.machine_checks.iter());

        for check in checks {
            let mut template = MachineConfig {
                image: check
                    .image
                    .clone()
                    .unwrap_or_else(|| machine.image().to_owned()),
                env: machine.config.env.clone(),
                ..MachineConfig::default()
            };
            template.env.extend(check.env.clone());
            template
                .env
                .insert(CHECK_TARGET_ENV.to_owned(), machine.id.to_string());

            let config = command_config(&template, &check.command, TEST_MACHINE_GROUP);
            self.run_machine(config, &machine.region, timeout, cancel, "machine check")
                .await
                .map_err(|e| e.context(format!("machine check for {} failed", machine.id)))?;
        }
        Ok(())
    }

    async fn run_machine(
        &self,
        config: MachineConfig,
        region: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        what: &str,
    ) -> DeployResult<i32> {
        let input = LaunchInput {
            region: region.to_owned(),
            config,
            ..LaunchInput::default()
        };
        let machine = self.fleet.launch(&input).await?;
        let id = machine.id;

        info!(machine_id = %id, command = ?input.config.cmd, "running {what}");
        self.status.log_status(
            0,
            LineStatus::Running,
            &format!("Running {what} in machine {id}"),
        );

        wait_for_state(
            self.fleet.as_ref(),
            &id,
            MachineState::Started,
            timeout,
            true,
            cancel,
        )
        .await?;
        wait_for_state(
            self.fleet.as_ref(),
            &id,
            MachineState::Destroyed,
            timeout,
            false,
            cancel,
        )
        .await?;

        let finished = self.fleet.get(&id).await?;
        let exit_code = finished.last_exit_code().ok_or_else(|| {
            DeployError::internal(format!("could not find the exit code of machine {id}"))
        })?;

        if exit_code != 0 {
            let logs = self
                .fleet
                .logs(&id, COMMAND_LOG_LINES)
                .await
                .unwrap_or_else(|e| {
                    warn!(machine_id = %id, error = %e, "failed to fetch command logs");
                    Vec::new()
                });
            self.status.log_status(
                0,
                LineStatus::Failure,
                &format!("{what} in machine {id} exited with code {exit_code}"),
            );
            return Err(DeployError::CommandFailed {
                machine_id: id,
                exit_code,
                logs,
            });
        }

        self.status.log_status(
            0,
            LineStatus::Success,
            &format!("{what} in machine {id} completed successfully"),
        );
        Ok(exit_code)
    }

    /// Destroy command machines of `group` that are still around.
    async fn destroy_stale(&self, group: &str) {
        let machines = match self.fleet.list(&[]).await {
            Ok(machines) => machines,
            Err(e) => {
                warn!(error = %e, "failed to list stale command machines");
                return;
            }
        };

        for machine in machines.iter().filter(|m| m.process_group() == group) {
            let lease = match self.leases.acquire(&machine.id, self.lease_ttl).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!(machine_id = %machine.id, error = %e, "skipping stale command machine");
                    continue;
                }
            };
            match self
                .fleet
                .destroy(&machine.id, true, Some(&lease.nonce))
                .await
            {
                Ok(()) => info!(machine_id = %machine.id, "destroyed stale command machine"),
                Err(e) => {
                    warn!(machine_id = %machine.id, error = %e, "failed to destroy stale command machine");
                    if let Err(e) = self.leases.release(&machine.id, &lease.nonce).await {
                        warn!(machine_id = %machine.id, error = %e, "failed to release lease");
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("lease_ttl", &self.lease_ttl)
            .finish_non_exhaustive()
    }
}

/// Config for a one-shot machine running `command`, derived from `template`.
fn command_config(template: &MachineConfig, command: &[String], group: &str) -> MachineConfig {
    let mut config = template.clone();
    config.cmd = command.to_vec();
    config.auto_destroy = true;
    config.restart = Some(RestartPolicy::No);
    config.services.clear();
    config.checks.clear();
    config.mounts.clear();
    config
        .metadata
        .insert(METADATA_PROCESS_GROUP.to_owned(), group.to_owned());
    config
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fleet::{FleetCall, MockFleet};
    use crate::status::TracingStatus;
    use crate::types::{MachineCheck, MachineId, Service};

    fn runner(fleet: Arc<MockFleet>) -> CommandRunner {
        CommandRunner::new(fleet, Arc::new(TracingStatus), Duration::from_secs(13))
    }

    fn template() -> MachineConfig {
        MachineConfig {
            image: "registry/app:2".to_owned(),
            services: vec![Service {
                protocol: "tcp".to_owned(),
                internal_port: 8080,
                ..Service::default()
            }],
            ..MachineConfig::default()
        }
    }

    fn migrate() -> Vec<String> {
        vec!["bin/migrate".to_owned()]
    }

    #[tokio::test]
    async fn successful_command_returns_zero() {
        let fleet = Arc::new(MockFleet::new());
        let code = runner(fleet.clone())
            .run_once(
                &migrate(),
                &template(),
                "lhr",
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(fleet.live_machines().is_empty());
    }

    #[tokio::test]
    async fn failing_command_carries_exit_code_and_logs() {
        let fleet = Arc::new(MockFleet::new());
        fleet.set_command_result(2, vec!["relation \"users\" does not exist".to_owned()]);

        let err = runner(fleet.clone())
            .run_once(
                &migrate(),
                &template(),
                "lhr",
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            DeployError::CommandFailed {
                exit_code, logs, ..
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(logs.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_release_machines_are_destroyed_first() {
        let fleet = Arc::new(MockFleet::new());
        let mut stale = template();
        stale.metadata.insert(
            METADATA_PROCESS_GROUP.to_owned(),
            RELEASE_COMMAND_GROUP.to_owned(),
        );
        let stale = fleet
            .launch(&LaunchInput {
                region: "lhr".to_owned(),
                config: stale,
                ..LaunchInput::default()
            })
            .await
            .unwrap();

        runner(fleet.clone())
            .run_once(
                &migrate(),
                &template(),
                "lhr",
                Duration::from_secs(2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(fleet.calls().contains(&FleetCall::Destroy(stale.id)));
    }

    #[tokio::test]
    async fn machine_checks_run_against_the_target() {
        let fleet = Arc::new(MockFleet::new());
        fleet.set_command_result(1, Vec::new());
        let mut config = template();
        config.services[0].machine_checks.push(MachineCheck {
            command: vec!["curl".to_owned(), "http://target:8080".to_owned()],
            ..MachineCheck::default()
        });
        let target = Machine {
            id: MachineId::new("target"),
            region: "lhr".to_owned(),
            state: MachineState::Started,
            config,
            host_status: crate::types::HostStatus::Ok,
            checks: Vec::new(),
            events: Vec::new(),
            lease_nonce: None,
        };

        let err = runner(fleet.clone())
            .run_machine_checks(&target, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), DeployError::CommandFailed { exit_code: 1, .. }));

        let launched = fleet.calls().into_iter().find_map(|c| match c {
            FleetCall::Launch { group, .. } => Some(group),
            _ => None,
        });
        assert_eq!(launched.as_deref(), Some(TEST_MACHINE_GROUP));
    }
}
