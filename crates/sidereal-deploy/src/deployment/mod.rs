//! Deployment orchestration.
//!
//! [`MachineDeployment`] takes an app from the machines it runs today to the
//! machines its templates describe: release command first, then leases, the
//! diff, stale groups, new groups and finally the strategy over the updates.

mod manager;

pub use manager::{DeploymentSummary, MachineDeployment, RELEASE_STATUS_GRACE};
