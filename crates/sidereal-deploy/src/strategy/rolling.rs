//! Rolling updates: bounded waves per process group.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{pool_size, update_and_wait, Strategy, StrategyContext, UpdateEntry};
use crate::batch::into_batches;
use crate::error::{DeployError, DeployResult};

/// Process groups updated at the same time.
const MAX_CONCURRENT_GROUPS: usize = 10;

/// Updates each process group in waves no larger than its pool size.
///
/// The first machine of a group is updated on its own. If it fails, nothing
/// else in the group is touched. A failed group stops its sibling groups
/// before their next wave.
#[derive(Debug, Clone)]
pub struct RollingStrategy {
    ctx: StrategyContext,
}

impl RollingStrategy {
    #[must_use]
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Strategy for RollingStrategy {
    fn name(&self) -> &'static str {
        "rolling"
    }

    async fn apply(&self, entries: Vec<UpdateEntry>, cancel: &CancellationToken) -> DeployResult<()> {
        let mut groups: BTreeMap<String, Vec<UpdateEntry>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry(entry.machine.process_group())
                .or_default()
                .push(entry);
        }

        let mut planned = Vec::with_capacity(groups.len());
        let mut first_line = 0;
        for (group, mut entries) in groups {
            entries.sort_by_key(|e| e.machine.id());
            let pool = pool_size(self.ctx.settings.max_unavailable, entries.len())?;
            let lines = entries.len();
            planned.push((group, entries, pool, first_line));
            first_line += lines;
        }

        let limit = Arc::new(Semaphore::new(MAX_CONCURRENT_GROUPS));
        let cancel = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (group, entries, pool, first_line) in planned {
            let ctx = self.ctx.clone();
            let limit = Arc::clone(&limit);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|e| DeployError::internal(format!("group limiter closed: {e}")))?;
                update_group(&ctx, &group, entries, pool, first_line, &cancel)
                    .await
                    .map_err(|e| e.context(format!("failed to update process group {group}")))
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(DeployError::internal(format!("group update task failed: {e}"))));
            if let Err(e) = result {
                if !errors.is_empty() && e.is_cancelled() {
                    debug!(error = %e, "process group stopped after a sibling failed");
                    continue;
                }
                cancel.cancel();
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DeployError::Aggregate(errors)),
        }
    }
}

async fn update_group(
    ctx: &StrategyContext,
    group: &str,
    entries: Vec<UpdateEntry>,
    pool: usize,
    first_line: usize,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    let total = entries.len();
    let waves = into_batches(entries, total.saturating_sub(1).div_ceil(pool), true);
    info!(
        group,
        machines = total,
        pool,
        waves = waves.len(),
        "starting rolling update"
    );

    let cancel = cancel.child_token();
    let mut line = first_line;

    for wave in waves {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let mut tasks = JoinSet::new();
        for entry in wave {
            tasks.spawn(update_with_retries(ctx.clone(), entry, line, cancel.clone()));
            line += 1;
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(DeployError::internal(format!("machine update task failed: {e}"))));
            if let Err(e) = result {
                if first_error.is_none() {
                    cancel.cancel();
                    first_error = Some(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
    }

    info!(group, machines = total, "rolling update complete");
    Ok(())
}

async fn update_with_retries(
    ctx: StrategyContext,
    mut entry: UpdateEntry,
    line: usize,
    cancel: CancellationToken,
) -> DeployResult<()> {
    let mut attempt = 0;
    loop {
        let (current, result) = update_and_wait(&ctx, &entry, line, true, &cancel).await;
        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if attempt >= ctx.settings.deploy_retries || err.is_unrecoverable() || cancel.is_cancelled() {
            return Err(err);
        }

        attempt += 1;
        warn!(
            machine_id = %current.id(),
            attempt,
            max_retries = ctx.settings.deploy_retries,
            error = %err,
            "machine update failed, retrying"
        );
        if !Arc::ptr_eq(&current, &entry.machine) {
            entry.launch_input.requires_replacement = false;
            entry.launch_input.id = Some(current.id());
            entry.machine = current;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fleet::{FleetCall, MockFleet, UpdateFault};
    use crate::machine::LeasableMachine;
    use crate::status::TracingStatus;
    use crate::strategy::StrategySettings;
    use crate::types::{
        HostStatus, LaunchInput, Machine, MachineConfig, MachineId, MachineState,
        METADATA_PROCESS_GROUP,
    };

    fn seed(fleet: &Arc<MockFleet>, id: &str, group: &str) -> UpdateEntry {
        let mut config = MachineConfig {
            image: "app:1".to_owned(),
            ..MachineConfig::default()
        };
        config
            .metadata
            .insert(METADATA_PROCESS_GROUP.to_owned(), group.to_owned());
        let machine = Machine {
            id: MachineId::new(id),
            region: "lhr".to_owned(),
            state: MachineState::Started,
            config: config.clone(),
            host_status: HostStatus::Ok,
            checks: Vec::new(),
            events: Vec::new(),
            lease_nonce: None,
        };
        fleet.insert_machine(machine.clone());
        config.image = "app:2".to_owned();
        UpdateEntry {
            launch_input: LaunchInput {
                id: Some(machine.id.clone()),
                region: "lhr".to_owned(),
                config,
                ..LaunchInput::default()
            },
            machine: Arc::new(LeasableMachine::new(fleet.clone(), machine)),
        }
    }

    fn strategy(fleet: &Arc<MockFleet>, settings: StrategySettings) -> RollingStrategy {
        RollingStrategy::new(StrategyContext::new(
            fleet.clone(),
            StrategySettings {
                wait_timeout: Duration::from_secs(2),
                ..settings
            },
            Arc::new(TracingStatus),
        ))
    }

    #[tokio::test]
    async fn updates_every_machine() {
        let fleet = Arc::new(MockFleet::new());
        let entries: Vec<_> = (0..5).map(|i| seed(&fleet, &format!("m{i}"), "app")).collect();

        strategy(&fleet, StrategySettings::default())
            .apply(entries, &CancellationToken::new())
            .await
            .unwrap();

        assert!(fleet.live_machines().iter().all(|m| m.image() == "app:2"));
    }

    #[tokio::test]
    async fn failing_spearhead_stops_the_group() {
        let fleet = Arc::new(MockFleet::new());
        let entries: Vec<_> = (0..4).map(|i| seed(&fleet, &format!("m{i}"), "app")).collect();
        fleet.set_update_fault(&MachineId::new("m0"), UpdateFault::Rejected);

        let err = strategy(&fleet, StrategySettings::default())
            .apply(entries, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.root(), DeployError::Api { status: 422, .. }));

        let updates = fleet
            .calls()
            .into_iter()
            .filter(|c| matches!(c, FleetCall::Update(_)))
            .count();
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn retries_a_failed_machine() {
        let fleet = Arc::new(MockFleet::new());
        let entries = vec![seed(&fleet, "m0", "app")];
        fleet.set_update_fault(&MachineId::new("m0"), UpdateFault::Rejected);

        strategy(
            &fleet,
            StrategySettings {
                deploy_retries: 1,
                ..StrategySettings::default()
            },
        )
        .apply(entries, &CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(fleet.machine(&MachineId::new("m0")).unwrap().image(), "app:2");
    }

    #[tokio::test]
    async fn failed_group_stops_sibling_groups() {
        let fleet = Arc::new(MockFleet::new().with_timing(
            Duration::from_millis(200),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));
        let mut entries = vec![seed(&fleet, "w0", "worker")];
        entries.extend((0..4).map(|i| seed(&fleet, &format!("a{i}"), "app")));
        fleet.set_update_fault(&MachineId::new("w0"), UpdateFault::Rejected);

        let err = strategy(
            &fleet,
            StrategySettings {
                max_unavailable: 1.0,
                ..StrategySettings::default()
            },
        )
        .apply(entries, &CancellationToken::new())
        .await
        .unwrap_err();
        assert!(err.to_string().contains("worker"));

        let updated: Vec<MachineId> = fleet
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                FleetCall::Update(id) => Some(id),
                _ => None,
            })
            .filter(|id| id.as_str().starts_with('a'))
            .collect();
        assert!(updated.len() <= 1, "app kept rolling: {updated:?}");
        for id in ["a1", "a2", "a3"] {
            assert_eq!(fleet.machine(&MachineId::new(id)).unwrap().image(), "app:1");
        }
    }
}
