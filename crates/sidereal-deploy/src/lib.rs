//! Sidereal Deploy
//!
//! This crate rolls a new release out to an app's machines through a fleet
//! API. Every machine is leased before it is touched, so two deployments
//! never fight over the same machine.
//!
//! # Architecture
//!
//! - **Leases**: [`LeaseManager`] takes, refreshes and releases machine
//!   leases; [`LeasableMachine`] carries one and refuses to mutate without it
//! - **Waiting**: [`wait`] polls a machine until it reaches a state or passes
//!   its health checks
//! - **Planning**: [`Planner`] diffs the observed machines against the
//!   process group templates
//! - **Commands**: [`CommandRunner`] runs release commands and machine checks
//!   in throwaway machines
//! - **Strategies**: rolling, blue/green and immediate executors apply the
//!   planned updates
//! - **Orchestration**: [`MachineDeployment`] runs the whole deployment
//!
//! # Deployment stages
//!
//! ```text
//! Init ──▶ ReleaseCommand ──▶ AcquireLeases ──▶ Diff ──▶ DestroyStaleGroups
//!                                                               │
//!        Done ◀── ReleaseLeases ◀── Strategy(updates) ◀── CreateNewGroups
//! ```
//!
//! Leases are released on every path out, including errors and panics.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use sidereal_deploy::{
//!     create_fleet, DeployConfig, MachineDeployment, Manifest, TracingStatus,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config = DeployConfig::load()?;
//! let manifest = Manifest::from_file(&config.manifest)?;
//! let fleet = create_fleet(&config.fleet)?;
//!
//! let deployment =
//!     MachineDeployment::new(fleet, Arc::new(manifest), &config, Arc::new(TracingStatus))?;
//! let summary = deployment
//!     .deploy_machines_app(&CancellationToken::new())
//!     .await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod backoff;
pub mod batch;
pub mod command;
pub mod config;
pub mod deployment;
pub mod error;
pub mod fleet;
pub mod lease;
pub mod machine;
pub mod plan;
pub mod service;
pub mod status;
pub mod strategy;
pub mod types;
pub mod wait;

// Re-export commonly used types at the crate root
pub use backoff::{Backoff, RetryPolicy};
pub use batch::BatchAllocator;
pub use command::CommandRunner;
pub use config::{DeployConfig, FleetConfig, ReleaseConfig, RolloutConfig};
pub use deployment::{DeploymentSummary, MachineDeployment};
pub use error::{BlueGreenStage, DeployError, DeployResult};
pub use fleet::{create_fleet, FleetApi, FleetClient, MockFleet};
pub use lease::LeaseManager;
pub use machine::{LeasableMachine, MachineSet};
pub use plan::{DeploymentPlan, Disposition, MachineTemplates, Manifest, Planner};
pub use service::DeployService;
pub use status::{LineStatus, StatusSink, TracingStatus};
pub use strategy::{DeploymentStrategy, Strategy, StrategyContext, StrategySettings, UpdateEntry};
pub use types::{LaunchInput, Machine, MachineConfig, MachineId, MachineState};
