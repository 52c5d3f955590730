//! In-memory fleet for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{DeployError, DeployResult};
use crate::types::{
    CheckState, CheckStatus, CreateVolumeRequest, EventKind, HostStatus, LaunchInput, Lease,
    Machine, MachineEvent, MachineId, MachineState, ReleaseStatus, Volume,
};

use super::FleetApi;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A call recorded by [`MockFleet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    Launch { id: MachineId, group: String },
    Update(MachineId),
    Start(MachineId),
    Stop(MachineId),
    Cordon(MachineId),
    Uncordon(MachineId),
    Destroy(MachineId),
    AcquireLease(MachineId),
    ReleaseLease(MachineId),
    SetMetadata { id: MachineId, key: String },
    CreateVolume { name: String, region: String },
}

/// Failure injected into the next update of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFault {
    /// The host cannot fit the new config.
    Placement,
    /// The API rejects the update outright.
    Rejected,
}

#[derive(Debug)]
struct Record {
    machine: Machine,
    boot_at: Option<Instant>,
    healthy_at: Option<Instant>,
    exit_at: Option<Instant>,
    exit_code: i32,
    never_healthy: bool,
    cordoned: bool,
}

#[derive(Debug)]
struct Inner {
    machines: BTreeMap<MachineId, Record>,
    leases: HashMap<MachineId, Lease>,
    volumes: Vec<Volume>,
    calls: Vec<FleetCall>,
    update_faults: HashMap<MachineId, UpdateFault>,
    failing_destroys: HashSet<MachineId>,
    unhealthy_images: HashSet<String>,
    command_exit_code: i32,
    command_logs: Vec<String>,
    release_statuses: Vec<(String, ReleaseStatus)>,
    release_status_unavailable: bool,
    unavailable: HashSet<MachineId>,
    max_unavailable: usize,
    clock: i64,
}

/// Fleet API backed by memory.
///
/// Machines boot after `boot_delay` and pass their checks `health_delay`
/// later. Auto-destroying machines exit `exit_delay` after boot with the
/// configured command exit code. Every mutating call requires the live
/// lease nonce, so tests catch unleased mutations.
#[derive(Debug)]
pub struct MockFleet {
    inner: Mutex<Inner>,
    boot_delay: Duration,
    health_delay: Duration,
    exit_delay: Duration,
}

impl Default for MockFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFleet {
    /// Create an empty fleet with short transition delays.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                machines: BTreeMap::new(),
                leases: HashMap::new(),
                volumes: Vec::new(),
                calls: Vec::new(),
                update_faults: HashMap::new(),
                failing_destroys: HashSet::new(),
                unhealthy_images: HashSet::new(),
                command_exit_code: 0,
                command_logs: Vec::new(),
                release_statuses: Vec::new(),
                release_status_unavailable: false,
                unavailable: HashSet::new(),
                max_unavailable: 0,
                clock: 0,
            }),
            boot_delay: Duration::from_millis(10),
            health_delay: Duration::from_millis(10),
            exit_delay: Duration::from_millis(10),
        }
    }

    /// Set the state transition delays.
    #[must_use]
    pub fn with_timing(mut self, boot: Duration, health: Duration, exit: Duration) -> Self {
        self.boot_delay = boot;
        self.health_delay = health;
        self.exit_delay = exit;
        self
    }

    /// Seed an existing machine. Started machines are seeded healthy.
    pub fn insert_machine(&self, mut machine: Machine) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if machine.state == MachineState::Started && machine.checks.is_empty() {
            machine.checks = check_statuses(&machine, CheckState::Passing);
        }
        for mount in &machine.config.mounts {
            attach_volume(&mut inner.volumes, &mount.volume, &machine.id);
        }
        inner.machines.insert(
            machine.id.clone(),
            Record {
                machine,
                boot_at: None,
                healthy_at: None,
                exit_at: None,
                exit_code: 0,
                never_healthy: false,
                cordoned: false,
            },
        );
    }

    /// Seed a volume.
    pub fn insert_volume(&self, volume: Volume) {
        self.inner.lock().volumes.push(volume);
    }

    /// Fail the next update of `id`.
    pub fn set_update_fault(&self, id: &MachineId, fault: UpdateFault) {
        self.inner.lock().update_faults.insert(id.clone(), fault);
    }

    /// Make every destroy of `id` fail.
    pub fn fail_destroy(&self, id: &MachineId) {
        self.inner.lock().failing_destroys.insert(id.clone());
    }

    /// Machines running `image` never pass their checks.
    pub fn set_unhealthy_image(&self, image: impl Into<String>) {
        self.inner.lock().unhealthy_images.insert(image.into());
    }

    /// Exit code and log output of auto-destroying command machines.
    pub fn set_command_result(&self, exit_code: i32, logs: Vec<String>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.command_exit_code = exit_code;
        inner.command_logs = logs;
    }

    /// Make every release status update fail.
    pub fn fail_release_status(&self) {
        self.inner.lock().release_status_unavailable = true;
    }

    /// Take a lease on behalf of some other holder.
    pub fn hold_lease(&self, id: &MachineId, owner: &str) -> Lease {
        let lease = Lease {
            nonce: ulid::Ulid::new().to_string(),
            expires_at: now_secs() + 3600,
            owner: owner.to_owned(),
        };
        self.inner.lock().leases.insert(id.clone(), lease.clone());
        lease
    }

    /// Calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<FleetCall> {
        self.inner.lock().calls.clone()
    }

    /// Largest number of machines that were updated or launched but not yet healthy at once.
    #[must_use]
    pub fn max_unavailable(&self) -> usize {
        self.inner.lock().max_unavailable
    }

    /// Release statuses reported so far.
    #[must_use]
    pub fn release_statuses(&self) -> Vec<(String, ReleaseStatus)> {
        self.inner.lock().release_statuses.clone()
    }

    /// Current snapshot of a machine, including destroyed ones.
    #[must_use]
    pub fn machine(&self, id: &MachineId) -> Option<Machine> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        settle_all(inner, Instant::now());
        inner.machines.get(id).map(|r| r.machine.clone())
    }

    /// Every machine that is not destroyed.
    #[must_use]
    pub fn live_machines(&self) -> Vec<Machine> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        settle_all(inner, Instant::now());
        inner
            .machines
            .values()
            .filter(|r| r.machine.state != MachineState::Destroyed)
            .map(|r| r.machine.clone())
            .collect()
    }

    /// Whether a live lease exists on `id`.
    #[must_use]
    pub fn is_leased(&self, id: &MachineId) -> bool {
        self.inner
            .lock()
            .leases
            .get(id)
            .is_some_and(|l| l.expires_at > now_secs())
    }

    /// Whether `id` is cordoned.
    #[must_use]
    pub fn is_cordoned(&self, id: &MachineId) -> bool {
        self.inner.lock().machines.get(id).is_some_and(|r| r.cordoned)
    }

    /// Current volumes.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.inner.lock().volumes.clone()
    }

    fn schedule_boot(&self, inner: &mut Inner, id: &MachineId, now: Instant) -> DeployResult<()> {
        let exit_code = inner.command_exit_code;
        let record = inner
            .machines
            .get_mut(id)
            .ok_or_else(|| DeployError::NotFound(format!("machine {id}")))?;
        let boot_at = now + self.boot_delay;
        record.machine.state = MachineState::Starting;
        record.machine.checks = check_statuses(&record.machine, CheckState::Critical);
        record.boot_at = Some(boot_at);
        record.healthy_at = Some(boot_at + self.health_delay);
        record.never_healthy = inner.unhealthy_images.contains(record.machine.image());
        if record.machine.config.auto_destroy {
            record.exit_at = Some(boot_at + self.exit_delay);
            record.exit_code = exit_code;
        }
        Ok(())
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn check_statuses(machine: &Machine, state: CheckState) -> Vec<CheckStatus> {
    let config = &machine.config;
    let top_level = config.checks.keys().cloned();
    let service_level = config.services.iter().enumerate().flat_map(|(i, service)| {
        service
            .checks
            .iter()
            .enumerate()
            .map(move |(j, _)| format!("servicecheck-{i:02}-{j:02}"))
    });
    top_level
        .chain(service_level)
        .map(|name| CheckStatus {
            name,
            status: state,
            output: String::new(),
        })
        .collect()
}

fn attach_volume(volumes: &mut [Volume], volume_id: &str, machine_id: &MachineId) {
    if let Some(volume) = volumes.iter_mut().find(|v| v.id == volume_id) {
        volume.attached_machine_id = Some(machine_id.clone());
    }
}

fn push_event(inner_clock: &mut i64, machine: &mut Machine, kind: EventKind, exit_code: Option<i32>) {
    *inner_clock += 1;
    machine.events.push(MachineEvent {
        kind,
        timestamp: *inner_clock,
        exit_code,
    });
}

fn settle_all(inner: &mut Inner, now: Instant) {
    let Inner {
        machines,
        leases,
        volumes,
        unavailable,
        clock,
        ..
    } = inner;

    for (id, record) in machines.iter_mut() {
        if record.machine.state == MachineState::Starting
            && record.boot_at.is_some_and(|t| t <= now)
        {
            record.machine.state = MachineState::Started;
            record.boot_at = None;
            push_event(clock, &mut record.machine, EventKind::Start, None);
            if record.machine.checks.is_empty() {
                record.healthy_at = None;
                unavailable.remove(id);
            }
        }

        if record.machine.state == MachineState::Started
            && record.healthy_at.is_some_and(|t| t <= now)
            && !record.never_healthy
        {
            record.healthy_at = None;
            for check in &mut record.machine.checks {
                check.status = CheckState::Passing;
            }
            unavailable.remove(id);
        }

        if record.machine.state == MachineState::Started
            && record.exit_at.is_some_and(|t| t <= now)
        {
            record.exit_at = None;
            let code = record.exit_code;
            push_event(clock, &mut record.machine, EventKind::Exit, Some(code));
            if record.machine.config.auto_destroy {
                record.machine.state = MachineState::Destroyed;
                push_event(clock, &mut record.machine, EventKind::Destroy, None);
                leases.remove(id);
                for volume in volumes.iter_mut() {
                    if volume.attached_machine_id.as_ref() == Some(id) {
                        volume.attached_machine_id = None;
                    }
                }
            } else {
                record.machine.state = MachineState::Stopped;
            }
            unavailable.remove(id);
        }
    }
}

fn mark_unavailable(inner: &mut Inner, id: &MachineId) {
    inner.unavailable.insert(id.clone());
    inner.max_unavailable = inner.max_unavailable.max(inner.unavailable.len());
}

fn check_lease(inner: &Inner, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
    let live = inner.leases.get(id).filter(|l| l.expires_at > now_secs());
    match (live, nonce) {
        (Some(lease), Some(nonce)) if lease.nonce == nonce => Ok(()),
        (Some(lease), _) => Err(DeployError::LeaseConflict {
            machine_id: id.clone(),
            message: format!("lease currently held by {}", lease.owner),
        }),
        (None, _) => Err(DeployError::Api {
            status: 412,
            message: format!("machine {id} must be leased before it is modified"),
        }),
    }
}

fn live_record<'a>(inner: &'a mut Inner, id: &MachineId) -> DeployResult<&'a mut Record> {
    match inner.machines.get_mut(id) {
        Some(record) if record.machine.state != MachineState::Destroyed => Ok(record),
        _ => Err(DeployError::NotFound(format!("machine {id} not found"))),
    }
}

#[async_trait]
impl FleetApi for MockFleet {
    async fn launch(&self, input: &LaunchInput) -> DeployResult<Machine> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = MachineId::generate();
        let group = input.config.process_group().to_owned();

        let mut machine = Machine {
            id: id.clone(),
            region: input.region.clone(),
            state: MachineState::Created,
            config: input.config.clone(),
            host_status: HostStatus::Ok,
            checks: Vec::new(),
            events: Vec::new(),
            lease_nonce: None,
        };
        push_event(&mut inner.clock, &mut machine, EventKind::Launch, None);
        for mount in &input.config.mounts {
            attach_volume(&mut inner.volumes, &mount.volume, &id);
        }
        inner.machines.insert(
            id.clone(),
            Record {
                machine,
                boot_at: None,
                healthy_at: None,
                exit_at: None,
                exit_code: 0,
                never_healthy: false,
                cordoned: input.skip_service_registration,
            },
        );

        if !input.skip_launch {
            self.schedule_boot(inner, &id, now)?;
            if !input.config.auto_destroy {
                mark_unavailable(inner, &id);
            }
        }

        let nonce = input.lease_ttl.map(|ttl| {
            let lease = Lease {
                nonce: ulid::Ulid::new().to_string(),
                expires_at: now_secs() + i64::try_from(ttl).unwrap_or(i64::MAX / 2),
                owner: "deployer".to_owned(),
            };
            let nonce = lease.nonce.clone();
            inner.leases.insert(id.clone(), lease);
            nonce
        });

        inner.calls.push(FleetCall::Launch {
            id: id.clone(),
            group,
        });

        let record = live_record(inner, &id)?;
        let mut machine = record.machine.clone();
        machine.lease_nonce = nonce;
        Ok(machine)
    }

    async fn update(&self, input: &LaunchInput, nonce: Option<&str>) -> DeployResult<Machine> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let id = input
            .id
            .clone()
            .ok_or_else(|| DeployError::internal("update requires a machine ID"))?;
        live_record(inner, &id)?;
        check_lease(inner, &id, nonce)?;
        inner.calls.push(FleetCall::Update(id.clone()));

        match inner.update_faults.remove(&id) {
            Some(UpdateFault::Placement) => {
                return Err(DeployError::Placement(format!(
                    "could not reserve resource for machine {id}: insufficient memory"
                )))
            }
            Some(UpdateFault::Rejected) => {
                return Err(DeployError::Api {
                    status: 422,
                    message: format!("invalid config for machine {id}"),
                })
            }
            None => {}
        }

        let clock = &mut inner.clock;
        let record = inner
            .machines
            .get_mut(&id)
            .ok_or_else(|| DeployError::NotFound(format!("machine {id} not found")))?;
        record.machine.config = input.config.clone();
        push_event(clock, &mut record.machine, EventKind::Update, None);

        if input.skip_launch {
            record.machine.state = MachineState::Stopped;
        } else {
            self.schedule_boot(inner, &id, now)?;
            mark_unavailable(inner, &id);
        }

        Ok(live_record(inner, &id)?.machine.clone())
    }

    async fn start(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::Start(id.clone()));
        self.schedule_boot(inner, id, now)
    }

    async fn stop(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::Stop(id.clone()));
        let clock = &mut inner.clock;
        if let Some(record) = inner.machines.get_mut(id) {
            record.machine.state = MachineState::Stopped;
            record.boot_at = None;
            record.healthy_at = None;
            push_event(clock, &mut record.machine, EventKind::Stop, None);
        }
        Ok(())
    }

    async fn cordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::Cordon(id.clone()));
        live_record(inner, id)?.cordoned = true;
        Ok(())
    }

    async fn uncordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::Uncordon(id.clone()));
        live_record(inner, id)?.cordoned = false;
        Ok(())
    }

    async fn destroy(&self, id: &MachineId, _kill: bool, nonce: Option<&str>) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::Destroy(id.clone()));

        if inner.failing_destroys.contains(id) {
            return Err(DeployError::Api {
                status: 422,
                message: format!("failed to destroy machine {id}"),
            });
        }

        let clock = &mut inner.clock;
        if let Some(record) = inner.machines.get_mut(id) {
            record.machine.state = MachineState::Destroyed;
            record.boot_at = None;
            record.healthy_at = None;
            record.exit_at = None;
            push_event(clock, &mut record.machine, EventKind::Destroy, None);
        }
        inner.leases.remove(id);
        inner.unavailable.remove(id);
        for volume in &mut inner.volumes {
            if volume.attached_machine_id.as_ref() == Some(id) {
                volume.attached_machine_id = None;
            }
        }
        Ok(())
    }

    async fn list(&self, states: &[MachineState]) -> DeployResult<Vec<Machine>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        settle_all(inner, Instant::now());
        Ok(inner
            .machines
            .values()
            .map(|r| &r.machine)
            .filter(|m| {
                if states.is_empty() {
                    m.state != MachineState::Destroyed
                } else {
                    states.contains(&m.state)
                }
            })
            .cloned()
            .collect())
    }

    async fn get(&self, id: &MachineId) -> DeployResult<Machine> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        settle_all(inner, Instant::now());
        inner
            .machines
            .get(id)
            .map(|r| r.machine.clone())
            .ok_or_else(|| DeployError::NotFound(format!("machine {id} not found")))
    }

    async fn acquire_lease(&self, id: &MachineId, ttl_secs: u64) -> DeployResult<Lease> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        inner.calls.push(FleetCall::AcquireLease(id.clone()));

        if let Some(lease) = inner.leases.get(id).filter(|l| l.expires_at > now_secs()) {
            return Err(DeployError::LeaseConflict {
                machine_id: id.clone(),
                message: format!("lease currently held by {}", lease.owner),
            });
        }

        let lease = Lease {
            nonce: ulid::Ulid::new().to_string(),
            expires_at: now_secs() + i64::try_from(ttl_secs).unwrap_or(i64::MAX / 2),
            owner: "deployer".to_owned(),
        };
        inner.leases.insert(id.clone(), lease.clone());
        Ok(lease)
    }

    async fn refresh_lease(
        &self,
        id: &MachineId,
        ttl_secs: u64,
        nonce: &str,
    ) -> DeployResult<Lease> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        match inner.leases.get_mut(id) {
            Some(lease) if lease.nonce == nonce => {
                lease.expires_at = now_secs() + i64::try_from(ttl_secs).unwrap_or(i64::MAX / 2);
                Ok(lease.clone())
            }
            Some(lease) => Err(DeployError::LeaseConflict {
                machine_id: id.clone(),
                message: format!("lease currently held by {}", lease.owner),
            }),
            None => Err(DeployError::NotFound(format!("lease not found for {id}"))),
        }
    }

    async fn release_lease(&self, id: &MachineId, nonce: &str) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.calls.push(FleetCall::ReleaseLease(id.clone()));
        match inner.leases.get(id) {
            Some(lease) if lease.nonce == nonce => {
                inner.leases.remove(id);
                Ok(())
            }
            Some(lease) => Err(DeployError::LeaseConflict {
                machine_id: id.clone(),
                message: format!("lease currently held by {}", lease.owner),
            }),
            None => Err(DeployError::NotFound(format!("lease not found for {id}"))),
        }
    }

    async fn wait(
        &self,
        id: &MachineId,
        state: MachineState,
        timeout: Duration,
    ) -> DeployResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                settle_all(inner, Instant::now());
                let record = inner
                    .machines
                    .get(id)
                    .ok_or_else(|| DeployError::NotFound(format!("machine {id} not found")))?;
                if record.machine.state == state {
                    return Ok(());
                }
                if record.machine.state == MachineState::Destroyed {
                    return Err(DeployError::NotFound(format!("machine {id} was destroyed")));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(DeployError::Transient {
                    status: Some(408),
                    message: format!("machine {id} did not reach {state} in time"),
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn set_metadata(
        &self,
        id: &MachineId,
        key: &str,
        value: &str,
        nonce: Option<&str>,
    ) -> DeployResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        live_record(inner, id)?;
        check_lease(inner, id, nonce)?;
        inner.calls.push(FleetCall::SetMetadata {
            id: id.clone(),
            key: key.to_owned(),
        });
        live_record(inner, id)?
            .machine
            .config
            .metadata
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn list_volumes(&self) -> DeployResult<Vec<Volume>> {
        Ok(self.inner.lock().volumes.clone())
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> DeployResult<Volume> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let volume = Volume {
            id: format!("vol_{}", ulid::Ulid::new().to_string().to_lowercase()),
            name: request.name.clone(),
            region: request.region.clone(),
            size_gb: request.size_gb,
            attached_machine_id: None,
        };
        inner.calls.push(FleetCall::CreateVolume {
            name: request.name.clone(),
            region: request.region.clone(),
        });
        inner.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn logs(&self, id: &MachineId, limit: usize) -> DeployResult<Vec<String>> {
        let inner = self.inner.lock();
        if !inner.machines.contains_key(id) {
            return Err(DeployError::NotFound(format!("machine {id} not found")));
        }
        let skip = inner.command_logs.len().saturating_sub(limit);
        Ok(inner.command_logs[skip..].to_vec())
    }

    async fn update_release_status(
        &self,
        release_id: &str,
        status: ReleaseStatus,
    ) -> DeployResult<()> {
        let mut inner = self.inner.lock();
        if inner.release_status_unavailable {
            return Err(DeployError::Api {
                status: 422,
                message: format!("release {release_id} cannot be updated"),
            });
        }
        inner
            .release_statuses
            .push((release_id.to_owned(), status));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::MachineConfig;

    fn launch_input() -> LaunchInput {
        LaunchInput {
            region: "lhr".to_owned(),
            config: MachineConfig {
                image: "registry/app:1".to_owned(),
                ..MachineConfig::default()
            },
            ..LaunchInput::default()
        }
    }

    #[tokio::test]
    async fn launched_machine_boots() {
        let fleet = MockFleet::new();
        let machine = fleet.launch(&launch_input()).await.unwrap();
        assert_eq!(machine.state, MachineState::Starting);

        fleet
            .wait(&machine.id, MachineState::Started, Duration::from_secs(1))
            .await
            .unwrap();
        let machine = fleet.get(&machine.id).await.unwrap();
        assert_eq!(machine.state, MachineState::Started);
        assert_eq!(fleet.live_machines().len(), 1);
    }

    #[tokio::test]
    async fn mutations_need_the_lease() {
        let fleet = MockFleet::new();
        let machine = fleet.launch(&launch_input()).await.unwrap();

        let err = fleet.stop(&machine.id, None).await.unwrap_err();
        assert!(matches!(err, DeployError::Api { status: 412, .. }));

        let lease = fleet.acquire_lease(&machine.id, 10).await.unwrap();
        fleet.stop(&machine.id, Some(&lease.nonce)).await.unwrap();
        fleet.release_lease(&machine.id, &lease.nonce).await.unwrap();
        assert!(!fleet.is_leased(&machine.id));
    }

    #[tokio::test]
    async fn wait_times_out_as_transient() {
        let fleet = MockFleet::new();
        let input = LaunchInput {
            skip_launch: true,
            ..launch_input()
        };
        let machine = fleet.launch(&input).await.unwrap();
        let err = fleet
            .wait(&machine.id, MachineState::Started, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn auto_destroy_machine_records_exit() {
        let fleet = MockFleet::new();
        fleet.set_command_result(3, vec!["boom".to_owned()]);
        let mut input = launch_input();
        input.config.auto_destroy = true;
        let machine = fleet.launch(&input).await.unwrap();

        fleet
            .wait(&machine.id, MachineState::Destroyed, Duration::from_secs(1))
            .await
            .unwrap();
        let machine = fleet.get(&machine.id).await.unwrap();
        assert_eq!(machine.last_exit_code(), Some(3));
        assert_eq!(fleet.logs(&machine.id, 100).await.unwrap(), vec!["boom"]);
    }
}
