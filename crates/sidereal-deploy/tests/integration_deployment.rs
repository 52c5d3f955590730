//! Integration tests for whole deployments: planning, leases and release commands.

mod common;

use common::fixtures::{MachineBuilder, ManifestBuilder};
use common::TestFleet;
use sidereal_deploy::fleet::FleetCall;
use sidereal_deploy::types::{HostStatus, MachineId, ReleaseStatus};
use sidereal_deploy::DeployError;

const V1: &str = "registry.example.com/web:v1";
const V2: &str = "registry.example.com/web:v2";

fn mutations(calls: &[FleetCall]) -> usize {
    calls
        .iter()
        .filter(|c| !matches!(c, FleetCall::AcquireLease(_) | FleetCall::ReleaseLease(_)))
        .count()
}

#[tokio::test]
async fn converged_fleet_is_left_alone() {
    let test = TestFleet::new();
    let manifest = || ManifestBuilder::new(V1).with_group("app", 2).build();

    let first = test.deploy(manifest()).await.unwrap();
    assert_eq!(first.created, 2);
    let before = test.fleet.calls().len();

    let second = test.deploy(manifest()).await.unwrap();
    assert_eq!(second.unchanged, 2);
    assert_eq!(mutations(&test.fleet.calls()[before..]), 0);
}

#[tokio::test]
async fn unreachable_host_forces_replacement() {
    let test = TestFleet::new();
    test.fleet.insert_machine(
        MachineBuilder::new("m0")
            .with_host_status(HostStatus::Unreachable)
            .build(),
    );

    let summary = test
        .deploy(ManifestBuilder::new(V2).with_group("app", 1).build())
        .await
        .unwrap();

    assert_eq!(summary.replaced, 1);
    let live = test.fleet.live_machines();
    assert_eq!(live.len(), 1);
    assert_ne!(live[0].id, MachineId::new("m0"));
    assert_eq!(live[0].image(), V2);
}

#[tokio::test]
async fn removed_groups_are_destroyed_and_new_ones_created() {
    let test = TestFleet::new();
    test.fleet
        .insert_machine(MachineBuilder::new("w0").with_group("worker").build());
    test.fleet.insert_machine(MachineBuilder::new("a0").build());

    let summary = test
        .deploy(ManifestBuilder::new(V1).with_group("app", 1).with_group("web", 2).build())
        .await
        .unwrap();

    assert_eq!(summary.destroyed, 1);
    assert_eq!(summary.created, 2);
    let live = test.fleet.live_machines();
    assert_eq!(live.len(), 3);
    assert!(live.iter().all(|m| m.process_group() != "worker"));
}

#[tokio::test]
async fn update_only_never_creates_machines() {
    let mut test = TestFleet::new();
    test.config.deploy.update_only = true;
    test.fleet.insert_machine(MachineBuilder::new("a0").build());

    let summary = test
        .deploy(ManifestBuilder::new(V2).with_group("app", 3).build())
        .await
        .unwrap();

    assert_eq!(summary.created, 0);
    assert_eq!(test.images(), vec![V2.to_owned()]);
}

#[tokio::test]
async fn machine_leased_elsewhere_blocks_the_deployment() {
    let test = TestFleet::new();
    test.fleet.insert_machine(MachineBuilder::new("m0").build());
    test.fleet.insert_machine(MachineBuilder::new("m1").build());
    test.fleet.hold_lease(&MachineId::new("m1"), "other-deployer");

    let err = test
        .deploy(ManifestBuilder::new(V2).with_group("app", 2).build())
        .await
        .unwrap_err();

    assert!(matches!(err.root(), DeployError::LeaseConflict { .. }));
    assert_eq!(test.images(), vec![V1.to_owned(); 2]);
    assert!(!test.fleet.is_leased(&MachineId::new("m0")));
    assert!(test.fleet.is_leased(&MachineId::new("m1")));
    assert_eq!(
        test.fleet.release_statuses().last().map(|(_, s)| *s),
        Some(ReleaseStatus::Failed)
    );
}

#[tokio::test]
async fn failing_release_command_gates_the_rollout() {
    let mut test = TestFleet::new();
    test.config.release.command = Some(vec!["bin/migrate".to_owned()]);
    test.fleet.insert_machine(MachineBuilder::new("m0").build());
    test.fleet
        .set_command_result(3, vec!["relation already exists".to_owned()]);

    let err = test
        .deploy(ManifestBuilder::new(V2).with_group("app", 1).build())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("release command failed"));
    assert_eq!(test.images(), vec![V1.to_owned()]);
    assert!(!test
        .fleet
        .calls()
        .iter()
        .any(|c| matches!(c, FleetCall::Update(_) | FleetCall::AcquireLease(_))));
}

#[tokio::test]
async fn successful_release_command_runs_before_updates() {
    let mut test = TestFleet::new();
    test.config.release.command = Some(vec!["bin/migrate".to_owned()]);
    test.fleet.insert_machine(MachineBuilder::new("m0").build());

    test.deploy(ManifestBuilder::new(V2).with_group("app", 1).build())
        .await
        .unwrap();

    let calls = test.fleet.calls();
    let command = calls
        .iter()
        .position(|c| matches!(c, FleetCall::Launch { group, .. } if group == "release_command"))
        .unwrap();
    let update = calls
        .iter()
        .position(|c| matches!(c, FleetCall::Update(_)))
        .unwrap();
    assert!(command < update);
    assert_eq!(test.images(), vec![V2.to_owned()]);
}

#[tokio::test]
async fn restart_only_keeps_images() {
    let mut test = TestFleet::new();
    test.config.deploy.restart_only = true;
    test.config.release.command = Some(vec!["bin/migrate".to_owned()]);
    test.fleet.insert_machine(MachineBuilder::new("m0").build());
    test.fleet.insert_machine(MachineBuilder::new("m1").build());

    let summary = test
        .deploy(ManifestBuilder::new(V2).with_group("app", 2).build())
        .await
        .unwrap();

    assert_eq!(summary.restarted, 2);
    assert_eq!(test.images(), vec![V1.to_owned(); 2]);
    assert!(test
        .fleet
        .live_machines()
        .iter()
        .all(|m| m.config.metadata.get("release_id").map(String::as_str) == Some("rel_test")));
    assert!(!test
        .fleet
        .calls()
        .iter()
        .any(|c| matches!(c, FleetCall::Launch { .. })));
}
