//! Test fixtures and builders for machines and manifests.

use std::time::Duration;

use sidereal_deploy::plan::GroupTemplate;
use sidereal_deploy::types::{
    HealthCheck, HostStatus, Machine, MachineConfig, MachineId, MachineState, Service,
    METADATA_PROCESS_GROUP,
};
use sidereal_deploy::Manifest;

/// A service check that settles quickly against the mock fleet.
pub fn fast_check() -> HealthCheck {
    HealthCheck {
        kind: Some("tcp".to_owned()),
        interval: Some(Duration::from_millis(20)),
        grace_period: Some(Duration::from_millis(5)),
        ..HealthCheck::default()
    }
}

/// A TCP service on port 8080 with one fast check.
pub fn checked_service() -> Service {
    Service {
        protocol: "tcp".to_owned(),
        internal_port: 8080,
        checks: vec![fast_check()],
        ..Service::default()
    }
}

/// Builder for machines seeded into the mock fleet.
pub struct MachineBuilder {
    id: String,
    group: String,
    image: String,
    region: String,
    state: MachineState,
    host_status: HostStatus,
    services: Vec<Service>,
}

impl MachineBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: "app".to_owned(),
            image: "registry.example.com/web:v1".to_owned(),
            region: "lhr".to_owned(),
            state: MachineState::Started,
            host_status: HostStatus::Ok,
            services: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_host_status(mut self, status: HostStatus) -> Self {
        self.host_status = status;
        self
    }

    pub fn with_checks(mut self) -> Self {
        self.services = vec![checked_service()];
        self
    }

    pub fn build(self) -> Machine {
        let mut config = MachineConfig {
            image: self.image,
            services: self.services,
            ..MachineConfig::default()
        };
        config
            .metadata
            .insert(METADATA_PROCESS_GROUP.to_owned(), self.group);

        Machine {
            id: MachineId::new(self.id),
            region: self.region,
            state: self.state,
            config,
            host_status: self.host_status,
            checks: Vec::new(),
            events: Vec::new(),
            lease_nonce: None,
        }
    }
}

/// Builder for manifests.
pub struct ManifestBuilder {
    manifest: Manifest,
}

impl ManifestBuilder {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            manifest: Manifest {
                image: image.into(),
                primary_region: "lhr".to_owned(),
                ..Manifest::default()
            },
        }
    }

    pub fn with_group(mut self, name: impl Into<String>, count: usize) -> Self {
        self.manifest.groups.insert(
            name.into(),
            GroupTemplate {
                count,
                ..GroupTemplate::default()
            },
        );
        self
    }

    /// Like [`Self::with_group`], with a checked service on every machine.
    pub fn with_checked_group(mut self, name: impl Into<String>, count: usize) -> Self {
        self.manifest.groups.insert(
            name.into(),
            GroupTemplate {
                count,
                config: MachineConfig {
                    services: vec![checked_service()],
                    ..MachineConfig::default()
                },
                ..GroupTemplate::default()
            },
        );
        self
    }

    pub fn build(self) -> Manifest {
        self.manifest
    }
}
