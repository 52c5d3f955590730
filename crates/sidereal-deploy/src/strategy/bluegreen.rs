//! Blue/green deployments.
//!
//! A green machine is launched next to every blue one, outside service
//! discovery. Once every green machine is started and healthy, green is
//! uncordoned and blue is tagged, cordoned, stopped and destroyed.
//!
//! Until green is marked ready a failure or an abort destroys the green
//! machines created so far. Past that point green is never destroyed: it is
//! already serving traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{release_quietly, Strategy, StrategyContext, UpdateEntry};
use crate::backoff::{sleep_or_cancel, RetryPolicy};
use crate::error::{BlueGreenStage, DeployError, DeployResult};
use crate::lease::refresh_interval;
use crate::machine::LeasableMachine;
use crate::status::LineStatus;
use crate::types::{MachineConfig, MachineId, MachineState, METADATA_BLUEGREEN_TAG};

/// Tag value marking blue machines that may be destroyed.
pub const SAFE_TO_DESTROY: &str = "safe_to_destroy";

/// Prefix of the top-level checks synthesized from service checks.
const CHECK_PREFIX: &str = "bg_deployments_";

/// Upper bound on parallel operations against the blue or green set.
const MAX_STAGE_CONCURRENCY: usize = 10;

/// Blue/green executor.
#[derive(Debug, Clone)]
pub struct BlueGreenStrategy {
    ctx: StrategyContext,
}

/// State of one blue/green run.
struct Run<'a> {
    ctx: &'a StrategyContext,
    cancel: &'a CancellationToken,
    green: Mutex<Vec<Arc<LeasableMachine>>>,
    ready: AtomicBool,
}

impl BlueGreenStrategy {
    #[must_use]
    pub fn new(ctx: StrategyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Strategy for BlueGreenStrategy {
    fn name(&self) -> &'static str {
        "bluegreen"
    }

    async fn apply(&self, mut entries: Vec<UpdateEntry>, cancel: &CancellationToken) -> DeployResult<()> {
        if cancel.is_cancelled() {
            return Err(DeployError::Aborted);
        }
        if entries.is_empty() {
            return Ok(());
        }

        detect_multiple_images(&entries);
        for entry in &mut entries {
            attach_bluegreen_checks(&mut entry.launch_input.config);
        }
        validate_checks(&entries)?;

        let mut taken = Vec::new();
        for entry in &entries {
            if !entry.machine.has_lease() {
                entry.machine.acquire_lease(self.ctx.settings.lease_ttl).await?;
                taken.push(Arc::clone(&entry.machine));
            }
        }

        let run = Run {
            ctx: &self.ctx,
            cancel,
            green: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        };

        let result = match run.delete_zombies(entries).await {
            Ok(blue) => run.deploy(&blue).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            run.rollback(e).await;
        }

        let green = run.green.lock().clone();
        for machine in green.iter().chain(taken.iter()) {
            release_quietly(machine, cancel).await;
        }
        result
    }
}

impl Run<'_> {
    async fn deploy(&self, blue: &[UpdateEntry]) -> DeployResult<()> {
        let tag = chrono::Utc::now().timestamp().to_string();

        info!(machines = blue.len(), tag = %tag, "creating green machines");
        self.create_green(blue, &tag)
            .await
            .map_err(|e| stage(BlueGreenStage::CreateGreenMachines, e))?;
        self.check_aborted()?;

        info!("waiting for green machines to start");
        self.for_green(|m, cancel, timeout| async move {
            m.wait_for_state(MachineState::Started, timeout, &cancel).await
        })
        .await
        .map_err(|e| stage(BlueGreenStage::WaitForStarted, e))?;
        self.check_aborted()?;

        info!("waiting for green machines to be healthy");
        self.for_green(|m, cancel, timeout| async move { m.wait_for_healthy(timeout, &cancel).await })
            .await
            .map_err(|e| stage(BlueGreenStage::WaitForHealthy, e))?;
        self.check_aborted()?;

        info!("marking green machines ready for traffic");
        self.for_green(|m, _, _| async move { m.uncordon().await })
            .await
            .map_err(|e| stage(BlueGreenStage::MarkReadyForTraffic, e))?;
        self.ready.store(true, Ordering::SeqCst);
        self.check_aborted()?;

        let blue: Vec<Arc<LeasableMachine>> = blue.iter().map(|e| Arc::clone(&e.machine)).collect();

        info!("tagging blue machines for deletion");
        first_error(
            for_each(&blue, |m| async move { m.set_metadata(METADATA_BLUEGREEN_TAG, SAFE_TO_DESTROY).await })
                .await,
        )
        .map_err(|e| stage(BlueGreenStage::TagForDeletion, e))?;
        self.check_aborted()?;

        self.pause(self.ctx.settings.cordon_delay).await?;
        info!("cordoning blue machines");
        for (id, result) in for_each(&blue, |m| async move { m.cordon().await }).await {
            if let Err(e) = result {
                warn!(machine_id = %id, error = %e, "failed to cordon blue machine");
            }
        }
        self.check_aborted()?;

        self.pause(self.ctx.settings.stop_delay).await?;
        info!("stopping blue machines");
        for (id, result) in for_each(&blue, |m| async move { m.stop().await }).await {
            if let Err(e) = result {
                warn!(machine_id = %id, error = %e, "failed to stop blue machine");
            }
        }

        info!("waiting for blue machines to stop");
        let timeout = self.ctx.settings.wait_timeout;
        let cancel = self.cancel;
        let stopped = for_each(&blue, |m| async move {
            m.wait_for_state(MachineState::Stopped, timeout, cancel).await
        })
        .await;
        for (id, result) in stopped {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    return Err(stage(BlueGreenStage::WaitForStopped, DeployError::Aborted))
                }
                Err(e) => warn!(machine_id = %id, error = %e, "blue machine did not stop"),
            }
        }

        info!("destroying blue machines");
        let mut hanging = Vec::new();
        let mut failures = Vec::new();
        for (id, result) in for_each(&blue, |m| async move { m.destroy(true).await }).await {
            if let Err(e) = result {
                hanging.push(id);
                failures.push(e);
            }
        }
        if !hanging.is_empty() {
            let ids: Vec<String> = hanging.iter().map(ToString::to_string).collect();
            warn!(
                machines = %ids.join(","),
                "failed to destroy blue machines, destroy them manually"
            );
            return Err(stage(
                BlueGreenStage::DestroyBlueMachines,
                DeployError::Aggregate(failures),
            ));
        }

        info!("blue/green deployment complete");
        Ok(())
    }

    /// Destroy blue machines left behind by an earlier run, keeping the newest tag.
    async fn delete_zombies(&self, blue: Vec<UpdateEntry>) -> DeployResult<Vec<UpdateEntry>> {
        let tags: BTreeSet<i64> = blue.iter().map(deployment_tag).collect();
        let Some(&newest) = tags.last() else {
            return Ok(blue);
        };
        if tags.len() == 1 {
            info!("no machines left over from a failed deployment");
            return Ok(blue);
        }

        let retry = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(2),
        };
        let mut survivors = Vec::with_capacity(blue.len());
        for entry in blue {
            if deployment_tag(&entry) == newest {
                survivors.push(entry);
                continue;
            }
            self.check_aborted()?;
            retry
                .run("destroy zombie machine", || entry.machine.destroy(true))
                .await?;
            info!(machine_id = %entry.machine.id(), "destroyed zombie machine");
        }
        Ok(survivors)
    }

    async fn create_green(&self, blue: &[UpdateEntry], tag: &str) -> DeployResult<()> {
        let settings = &self.ctx.settings;
        let limit = blue
            .len()
            .div_ceil(3)
            .min(settings.max_concurrent)
            .max(1);
        let ttl = settings.lease_ttl;
        let ttl_secs = self.ctx.lease_ttl_secs();
        let failed = CancellationToken::new();

        let launches: Vec<_> = blue
            .iter()
            .enumerate()
            .map(|(line, entry)| {
                let mut input = entry.launch_input.clone();
                input.id = None;
                input.requires_replacement = false;
                input.skip_service_registration = true;
                input.lease_ttl = Some(ttl_secs);
                input
                    .config
                    .metadata
                    .insert(METADATA_BLUEGREEN_TAG.to_owned(), tag.to_owned());
                let failed = failed.clone();
                let fleet = Arc::clone(&self.ctx.fleet);

                async move {
                    if failed.is_cancelled() || self.cancel.is_cancelled() {
                        return Err(DeployError::Aborted);
                    }
                    let launched = LeasableMachine::launch(fleet, &input)
                        .await
                        .inspect_err(|_| failed.cancel())?;
                    let launched = Arc::new(launched);
                    launched.start_background_refresh(ttl, refresh_interval(ttl), self.cancel);
                    self.ctx.status.log_status(
                        line,
                        LineStatus::Success,
                        &format!("Created green machine {}", launched.id()),
                    );
                    self.green.lock().push(launched);
                    Ok(())
                }
            })
            .collect();

        let results: Vec<DeployResult<()>> = stream::iter(launches)
            .buffer_unordered(limit)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Run `f` against every green machine, returning the first error.
    async fn for_green<F, Fut>(&self, f: F) -> DeployResult<()>
    where
        F: Fn(Arc<LeasableMachine>, CancellationToken, Duration) -> Fut,
        Fut: Future<Output = DeployResult<()>>,
    {
        let green = self.green.lock().clone();
        let cancel = self.cancel.clone();
        let timeout = self.ctx.settings.wait_timeout;
        first_error(for_each(&green, |m| f(m, cancel.clone(), timeout)).await)
    }

    async fn rollback(&self, err: &DeployError) {
        if err.blue_green_stage() == Some(BlueGreenStage::DestroyBlueMachines) {
            return;
        }
        let stage_rolls_back = err.blue_green_stage().is_some_and(|s| s.rolls_back_green());
        let aborted_early = err.is_cancelled() && !self.ready.load(Ordering::SeqCst);
        if !stage_rolls_back && !aborted_early {
            return;
        }

        let green = std::mem::take(&mut *self.green.lock());
        if green.is_empty() {
            return;
        }
        warn!(machines = green.len(), error = %err, "rolling back green machines");
        for machine in green {
            match machine.destroy(true).await {
                Ok(()) => info!(machine_id = %machine.id(), "destroyed green machine"),
                Err(e) => {
                    warn!(machine_id = %machine.id(), error = %e, "failed to destroy green machine");
                    release_quietly(&machine, self.cancel).await;
                }
            }
        }
    }

    fn check_aborted(&self) -> DeployResult<()> {
        if self.cancel.is_cancelled() {
            Err(DeployError::Aborted)
        } else {
            Ok(())
        }
    }

    async fn pause(&self, delay: Duration) -> DeployResult<()> {
        sleep_or_cancel(delay, self.cancel)
            .await
            .map_err(|_| DeployError::Aborted)
    }
}

fn stage(stage: BlueGreenStage, err: DeployError) -> DeployError {
    DeployError::BlueGreen {
        stage,
        source: Box::new(err),
    }
}

async fn for_each<F, Fut>(machines: &[Arc<LeasableMachine>], f: F) -> Vec<(MachineId, DeployResult<()>)>
where
    F: Fn(Arc<LeasableMachine>) -> Fut,
    Fut: Future<Output = DeployResult<()>>,
{
    stream::iter(machines.iter().cloned())
        .map(|m| {
            let id = m.id();
            let fut = f(m);
            async move { (id, fut.await) }
        })
        .buffer_unordered(MAX_STAGE_CONCURRENCY)
        .collect()
        .await
}

fn first_error(results: Vec<(MachineId, DeployResult<()>)>) -> DeployResult<()> {
    results
        .into_iter()
        .map(|(id, result)| result.map_err(|e| e.context(format!("machine {id}"))))
        .collect()
}

/// Blue/green tag of a machine. Untagged machines count as `-1` and tags
/// that are not timestamps sort below everything else.
fn deployment_tag(entry: &UpdateEntry) -> i64 {
    entry
        .machine
        .machine()
        .config
        .metadata
        .get(METADATA_BLUEGREEN_TAG)
        .map_or(-1, |tag| tag.parse().unwrap_or(i64::MIN))
}

/// Copy every service check into a top-level `bg_deployments_<type>` check.
pub(crate) fn attach_bluegreen_checks(config: &mut MachineConfig) {
    let mut synthesized = BTreeMap::new();
    for service in &config.services {
        for check in &service.checks {
            let mut check = check.clone();
            check.port.get_or_insert(service.internal_port);
            let kind = check
                .kind
                .get_or_insert_with(|| service.protocol.clone())
                .clone();
            synthesized.insert(format!("{CHECK_PREFIX}{kind}"), check);
        }
    }
    config.checks.extend(synthesized);
}

fn validate_checks(entries: &[UpdateEntry]) -> DeployResult<()> {
    let mut groups: BTreeMap<String, bool> = BTreeMap::new();
    for entry in entries {
        let checked = groups.entry(entry.machine.process_group()).or_default();
        *checked |= !entry.launch_input.config.checks.is_empty();
    }
    if let Some((group, _)) = groups.iter().find(|(_, checked)| !**checked) {
        return Err(DeployError::validation(format!(
            "blue/green deployments need health checks on every process group, '{group}' has none"
        )));
    }
    Ok(())
}

fn detect_multiple_images(entries: &[UpdateEntry]) {
    let mut images: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in entries {
        let machine = entry.machine.machine();
        images
            .entry(machine.image().to_owned())
            .or_default()
            .push(machine.id.to_string());
    }
    if images.len() > 1 {
        for (image, ids) in &images {
            warn!(image = %image, machines = %ids.join(","), "machines run different images");
        }
        warn!(
            images = images.len(),
            "blue/green works best when every machine runs a single image"
        );
    }
}
