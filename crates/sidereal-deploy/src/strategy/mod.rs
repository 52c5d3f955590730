//! Rollout strategies and the per-machine update they share.

mod bluegreen;
mod immediate;
mod rolling;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use bluegreen::BlueGreenStrategy;
pub use immediate::ImmediateStrategy;
pub use rolling::RollingStrategy;

use crate::command::CommandRunner;
use crate::config::RolloutConfig;
use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::machine::LeasableMachine;
use crate::status::{LineStatus, StatusSink};
use crate::types::{LaunchInput, MachineState};

/// How updated machines replace the running ones.
///
/// Each strategy has different trade-offs:
///
/// - **Rolling**: Updates machines in small waves while the rest keep serving.
///   - Pros: No extra capacity needed, failures stop early
///   - Cons: Old and new versions serve side by side during the rollout
///
/// - **BlueGreen**: Brings up a full green set next to blue, then cuts over.
///   - Pros: Cut-over is quick, blue is untouched until green is healthy
///   - Cons: Needs double capacity, requires health checks
///
/// - **Immediate**: Updates every machine at once without waiting.
///   - Pros: Fastest
///   - Cons: Downtime, unhealthy machines go unnoticed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStrategy {
    /// Update a bounded number of machines at a time.
    #[default]
    Rolling,

    /// Launch a parallel green set and retire blue once green is healthy.
    BlueGreen,

    /// Update everything at once, skipping health waits.
    Immediate,
}

impl DeploymentStrategy {
    /// Get the strategy name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rolling => "rolling",
            Self::BlueGreen => "bluegreen",
            Self::Immediate => "immediate",
        }
    }

    /// Executor for this strategy.
    #[must_use]
    pub fn executor(self, ctx: StrategyContext) -> Box<dyn Strategy> {
        match self {
            Self::Rolling => Box::new(RollingStrategy::new(ctx)),
            Self::BlueGreen => Box::new(BlueGreenStrategy::new(ctx)),
            Self::Immediate => Box::new(ImmediateStrategy::new(ctx)),
        }
    }
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Applies a set of machine updates.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Apply every entry, returning the first fatal error.
    async fn apply(&self, entries: Vec<UpdateEntry>, cancel: &CancellationToken)
        -> DeployResult<()>;
}

/// Knobs shared by all strategies.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub max_unavailable: f64,
    pub max_concurrent: usize,
    pub wait_timeout: Duration,
    pub lease_ttl: Duration,
    pub skip_health_checks: bool,
    pub deploy_retries: u32,
    pub machine_checks_fatal: bool,
    pub cordon_delay: Duration,
    pub stop_delay: Duration,
}

impl Default for StrategySettings {
    fn default() -> Self {
        RolloutConfig::default().strategy_settings()
    }
}

/// One machine and the input it should be updated with.
#[derive(Debug, Clone)]
pub struct UpdateEntry {
    pub machine: Arc<LeasableMachine>,
    pub launch_input: LaunchInput,
}

/// Everything a strategy needs to talk to the fleet.
#[derive(Clone)]
pub struct StrategyContext {
    pub fleet: Arc<dyn FleetApi>,
    pub settings: StrategySettings,
    pub status: Arc<dyn StatusSink>,
    pub commands: CommandRunner,
}

impl StrategyContext {
    #[must_use]
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        settings: StrategySettings,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let commands = CommandRunner::new(Arc::clone(&fleet), Arc::clone(&status), settings.lease_ttl);
        Self {
            fleet,
            settings,
            status,
            commands,
        }
    }

    /// Lease TTL in whole seconds, as sent with launches.
    pub(crate) fn lease_ttl_secs(&self) -> u64 {
        self.settings.lease_ttl.as_secs().max(1)
    }
}

impl fmt::Debug for StrategyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Number of machines of a group that may be down at once.
///
/// `max_unavailable` of 1 or more is an absolute count, a value in (0, 1) is
/// a share of `total` rounded up. The result is at least 1.
#[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn pool_size(max_unavailable: f64, total: usize) -> DeployResult<usize> {
    if !max_unavailable.is_finite() || max_unavailable <= 0.0 {
        return Err(DeployError::validation(format!(
            "invalid max_unavailable value {max_unavailable}"
        )));
    }
    let size = if max_unavailable >= 1.0 {
        max_unavailable as usize
    } else {
        (total as f64 * max_unavailable).ceil() as usize
    };
    Ok(size.max(1))
}

/// Update one machine and, when `wait` is set, wait for it to come back.
///
/// Returns the handle that is current afterwards, which is a new machine if
/// the old one was replaced, together with the outcome.
pub(crate) async fn update_and_wait(
    ctx: &StrategyContext,
    entry: &UpdateEntry,
    line: usize,
    wait: bool,
    cancel: &CancellationToken,
) -> (Arc<LeasableMachine>, DeployResult<()>) {
    let id = entry.machine.id();
    ctx.status
        .log_status(line, LineStatus::Running, &format!("Updating {id}"));

    let current = match apply_update(ctx, entry, cancel).await {
        Ok(current) => current,
        Err(e) => {
            ctx.status.log_status(
                line,
                LineStatus::Failure,
                &format!("Failed to update {id}: {e}"),
            );
            return (Arc::clone(&entry.machine), Err(e));
        }
    };

    let result = if wait && !ctx.settings.skip_health_checks && !entry.launch_input.skip_launch {
        wait_for_machine(ctx, &current, line, cancel).await
    } else {
        Ok(())
    };

    match &result {
        Ok(()) => ctx.status.log_status(
            line,
            LineStatus::Success,
            &format!("Machine {} is now in a good state", current.id()),
        ),
        Err(e) => ctx.status.log_status(
            line,
            LineStatus::Failure,
            &format!("Machine {} failed: {e}", current.id()),
        ),
    }
    (current, result)
}

/// Lease, mutate and release one machine.
async fn apply_update(
    ctx: &StrategyContext,
    entry: &UpdateEntry,
    cancel: &CancellationToken,
) -> DeployResult<Arc<LeasableMachine>> {
    let machine = &entry.machine;
    let took_lease = !machine.has_lease();
    if took_lease {
        machine.acquire_lease(ctx.settings.lease_ttl).await?;
    }

    let current = match mutate(ctx, entry).await {
        Ok(current) => current,
        Err(e) => {
            if took_lease {
                release_quietly(machine, cancel).await;
            }
            return Err(e);
        }
    };

    // A replacement arrives leased by us; the old lease went with the old machine.
    if took_lease || !Arc::ptr_eq(&current, machine) {
        release_quietly(&current, cancel).await;
    }
    Ok(current)
}

async fn mutate(ctx: &StrategyContext, entry: &UpdateEntry) -> DeployResult<Arc<LeasableMachine>> {
    if entry.launch_input.requires_replacement {
        return replace(ctx, entry).await;
    }

    match entry.machine.update(&entry.launch_input).await {
        Ok(()) => Ok(Arc::clone(&entry.machine)),
        Err(e) if e.is_placement() && !entry.machine.machine().has_mounts() => {
            warn!(
                machine_id = %entry.machine.id(),
                error = %e,
                "machine cannot be updated in place, replacing it"
            );
            replace(ctx, entry).await
        }
        Err(e) => Err(e),
    }
}

/// Destroy the machine and launch a new one from the same input.
async fn replace(ctx: &StrategyContext, entry: &UpdateEntry) -> DeployResult<Arc<LeasableMachine>> {
    let old_id = entry.machine.id();
    entry.machine.destroy(true).await?;

    let mut input = entry.launch_input.clone();
    input.id = None;
    input.requires_replacement = false;
    input.lease_ttl = Some(ctx.lease_ttl_secs());

    let launched = LeasableMachine::launch(Arc::clone(&ctx.fleet), &input).await?;
    info!(old_machine_id = %old_id, machine_id = %launched.id(), "replaced machine");
    Ok(Arc::new(launched))
}

/// Wait for started, run machine checks, then wait for healthy.
async fn wait_for_machine(
    ctx: &StrategyContext,
    machine: &LeasableMachine,
    line: usize,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    let timeout = ctx.settings.wait_timeout;
    let id = machine.id();

    ctx.status
        .log_status(line, LineStatus::Running, &format!("Waiting for {id} to start"));
    machine
        .wait_for_state(MachineState::Started, timeout, cancel)
        .await?;

    let snapshot = machine.refresh_state().await?;
    if let Err(e) = ctx.commands.run_machine_checks(&snapshot, timeout, cancel).await {
        if ctx.settings.machine_checks_fatal {
            return Err(e);
        }
        warn!(machine_id = %id, error = %e, "machine checks failed");
    }

    ctx.status.log_status(
        line,
        LineStatus::Running,
        &format!("Waiting for {id} to become healthy"),
    );
    machine.wait_for_healthy(timeout, cancel).await
}

pub(crate) async fn release_quietly(machine: &LeasableMachine, cancel: &CancellationToken) {
    if let Err(e) = machine.release_lease(cancel).await {
        warn!(machine_id = %machine.id(), error = %e, "failed to release lease");
    }
}
