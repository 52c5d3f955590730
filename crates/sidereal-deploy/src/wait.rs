//! Waiting for machines to reach a lifecycle state or pass their checks.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::{sleep_or_cancel, Backoff};
use crate::error::{DeployError, DeployResult};
use crate::fleet::FleetApi;
use crate::types::{HealthCheck, Machine, MachineId, MachineState};

/// Longest single long-poll against the fleet API.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_CHECK_GRACE: Duration = Duration::from_secs(1);
/// Floor for the health poll interval; a `0s` check interval would spin.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Wait until a machine reaches `state`.
///
/// Long-polls the fleet API in slices of at most 60 seconds, backing off
/// between retryable failures. A machine that no longer exists is an error
/// unless the target is `destroyed` or `allow_not_found` is set.
pub async fn wait_for_state(
    fleet: &dyn FleetApi,
    machine_id: &MachineId,
    state: MachineState,
    timeout: Duration,
    allow_not_found: bool,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::for_state_polling();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeployError::WaitTimeout {
                machine_id: machine_id.clone(),
                timeout,
                desired_state: state.to_string(),
            });
        }

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DeployError::Cancelled),
            result = fleet.wait(machine_id, state, remaining.min(MAX_POLL_TIMEOUT)) => result,
        };

        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {
                if state == MachineState::Destroyed || allow_not_found {
                    debug!(machine_id = %machine_id, state = %state, "machine gone while waiting");
                    return Ok(());
                }
                return Err(e);
            }
            Err(e) if e.is_retryable() => {
                debug!(machine_id = %machine_id, state = %state, error = %e, "still waiting");
            }
            Err(e) => return Err(e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep_or_cancel(backoff.next_delay().min(remaining), cancel).await?;
    }
}

/// Wait until every declared check of a machine is passing.
///
/// Machines without checks are healthy straight away. Otherwise the largest
/// grace period is slept first, then the machine is polled with a backoff
/// derived from the shortest check interval.
pub async fn wait_for_healthy(
    fleet: &dyn FleetApi,
    machine: &Machine,
    timeout: Duration,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    let config = &machine.config;
    let checks: Vec<&HealthCheck> = config
        .checks
        .values()
        .chain(config.services.iter().flat_map(|s| s.checks.iter()))
        .collect();
    if checks.is_empty() {
        return Ok(());
    }

    let interval = poll_interval(&checks);
    let grace = checks
        .iter()
        .filter_map(|c| c.grace_period)
        .max()
        .unwrap_or(DEFAULT_CHECK_GRACE);

    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new(interval / 2, interval * 2);

    sleep_or_cancel(grace.min(timeout), cancel).await?;

    loop {
        match fleet.get(&machine.id).await {
            Ok(current) => {
                let summary = current.check_summary();
                if summary.is_healthy() {
                    info!(machine_id = %machine.id, checks = %summary, "machine healthy");
                    return Ok(());
                }
                debug!(machine_id = %machine.id, checks = %summary, "waiting for health checks");
            }
            Err(e) if e.is_retryable() => {
                debug!(machine_id = %machine.id, error = %e, "failed to fetch machine, retrying");
            }
            Err(e) => return Err(e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeployError::WaitTimeout {
                machine_id: machine.id.clone(),
                timeout,
                desired_state: "healthy".to_owned(),
            });
        }
        sleep_or_cancel(backoff.next_delay().min(remaining), cancel).await?;
    }
}

/// Shortest declared check interval, clamped to [`MIN_CHECK_INTERVAL`].
fn poll_interval(checks: &[&HealthCheck]) -> Duration {
    checks
        .iter()
        .filter_map(|c| c.interval)
        .min()
        .unwrap_or(DEFAULT_CHECK_INTERVAL)
        .max(MIN_CHECK_INTERVAL)
}
