//! Error types for sidereal-deploy.

use std::fmt;
use std::time::Duration;

use crate::types::MachineId;

/// Result type alias using [`DeployError`].
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while deploying machines.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Another holder owns the machine's lease.
    #[error("machine {machine_id} is leased by another holder: {message}")]
    LeaseConflict {
        /// Machine whose lease could not be taken.
        machine_id: MachineId,
        /// Message reported by the fleet API.
        message: String,
    },

    /// Machine (or its lease) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Temporary failure of the fleet API (5xx, 408, 429, timeouts).
    #[error("transient fleet API error{}: {message}", fmt_status(.status))]
    Transient {
        /// HTTP status, if the failure came from a response.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// Request rejected by the fleet API.
    #[error("fleet API rejected request ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// The platform could not place the machine on a host.
    #[error("could not reserve resource for machine: {0}")]
    Placement(String),

    /// Machine did not reach the desired state in time.
    #[error("timeout reached waiting for machine {machine_id} to reach \"{desired_state}\" after {}", fmt_duration(.timeout))]
    WaitTimeout {
        /// Machine that was being waited on.
        machine_id: MachineId,
        /// Timeout that elapsed.
        timeout: Duration,
        /// State (or condition) that was never reached.
        desired_state: String,
    },

    /// A one-shot command machine exited with a non-zero code.
    #[error("machine {machine_id} exited with non-zero status of {exit_code}")]
    CommandFailed {
        /// Machine that ran the command.
        machine_id: MachineId,
        /// Exit code reported by the machine.
        exit_code: i32,
        /// Most recent log lines, when they could be fetched.
        logs: Vec<String>,
    },

    /// The deployment was cancelled.
    #[error("deployment cancelled")]
    Cancelled,

    /// The deployment was aborted by the user between stages.
    #[error("deployment aborted by user")]
    Aborted,

    /// Invalid configuration or plan.
    #[error("validation error: {0}")]
    Validation(String),

    /// Error that must stop the whole deployment.
    #[error("{0}")]
    Unrecoverable(Box<DeployError>),

    /// A blue/green stage failed.
    #[error("{stage}: {source}")]
    BlueGreen {
        /// Stage that failed.
        stage: BlueGreenStage,
        /// Underlying error.
        source: Box<DeployError>,
    },

    /// An error with orchestration context attached.
    #[error("{context}: {source}")]
    Stage {
        /// What was being done.
        context: String,
        /// Underlying error.
        source: Box<DeployError>,
    },

    /// Several machine operations failed.
    #[error("{}", fmt_aggregate(.0))]
    Aggregate(Vec<DeployError>),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stages of a blue/green deployment, used to decide how to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueGreenStage {
    /// Launching the green machines.
    CreateGreenMachines,
    /// Waiting for green machines to start.
    WaitForStarted,
    /// Waiting for green machines to pass health checks.
    WaitForHealthy,
    /// Uncordoning green machines.
    MarkReadyForTraffic,
    /// Tagging blue machines for deletion.
    TagForDeletion,
    /// Waiting for blue machines to stop.
    WaitForStopped,
    /// Destroying blue machines.
    DestroyBlueMachines,
}

impl BlueGreenStage {
    /// Get the stage description as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateGreenMachines => "failed to create green machines",
            Self::WaitForStarted => "failed to wait for green machines to start",
            Self::WaitForHealthy => "green machines did not become healthy",
            Self::MarkReadyForTraffic => "failed to mark green machines ready for traffic",
            Self::TagForDeletion => "failed to tag blue machines for deletion",
            Self::WaitForStopped => "failed to wait for blue machines to stop",
            Self::DestroyBlueMachines => "failed to destroy blue machines",
        }
    }

    /// Whether green machines must be destroyed when this stage fails.
    #[must_use]
    pub const fn rolls_back_green(&self) -> bool {
        matches!(
            self,
            Self::CreateGreenMachines
                | Self::WaitForStarted
                | Self::WaitForHealthy
                | Self::MarkReadyForTraffic
        )
    }
}

impl fmt::Display for BlueGreenStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

fn fmt_duration(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

fn fmt_aggregate(errors: &[DeployError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} errors: {}", errors.len(), messages.join("; "))
}

impl DeployError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a transient error without an HTTP status.
    #[must_use]
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: msg.into(),
        }
    }

    /// Wrap this error so it aborts the deployment regardless of strategy.
    #[must_use]
    pub fn unrecoverable(self) -> Self {
        match self {
            Self::Unrecoverable(_) => self,
            other => Self::Unrecoverable(Box::new(other)),
        }
    }

    /// Attach orchestration context to this error.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Stage {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Unwrap context layers down to the originating error.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Unrecoverable(inner) | Self::Stage { source: inner, .. } => inner.root(),
            Self::BlueGreen { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Transient { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the deployment must stop, even in continue-on-error modes.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            Self::Unrecoverable(_) | Self::Cancelled | Self::Aborted => true,
            Self::LeaseConflict { .. } => true,
            Self::Stage { source, .. } | Self::BlueGreen { source, .. } => {
                source.is_unrecoverable()
            }
            Self::Aggregate(errors) => errors.iter().any(Self::is_unrecoverable),
            _ => false,
        }
    }

    /// Whether this error reports a placement or capacity failure.
    #[must_use]
    pub fn is_placement(&self) -> bool {
        matches!(self.root(), Self::Placement(_))
    }

    /// Whether this error reports a missing machine or lease.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }

    /// Whether the deployment was interrupted rather than failing on its own.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::Aborted)
    }

    /// Blue/green stage that produced this error, if any.
    #[must_use]
    pub fn blue_green_stage(&self) -> Option<BlueGreenStage> {
        match self {
            Self::BlueGreen { stage, .. } => Some(*stage),
            Self::Stage { source, .. } | Self::Unrecoverable(source) => source.blue_green_stage(),
            _ => None,
        }
    }

    /// A hint for the operator, when one applies.
    #[must_use]
    pub fn suggestion(&self) -> Option<String> {
        match self.root() {
            Self::WaitTimeout { desired_state, .. } => {
                let increase = "increasing the timeout with `deploy.wait_timeout_secs`";
                if desired_state == "started" {
                    Some(format!(
                        "Your machine never reached the state \"started\". \
                         You can try deploying to a different region, or you can try {increase}"
                    ))
                } else {
                    Some(format!("You can try {increase}"))
                }
            }
            Self::CommandFailed { logs, .. } if !logs.is_empty() => {
                Some(format!("Recent output:\n{}", logs.join("\n")))
            }
            Self::LeaseConflict { .. } => Some(
                "Another deployment may be in progress. Wait for it to finish, then retry"
                    .to_owned(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_does_not_double_wrap() {
        let err = DeployError::internal("boom").unrecoverable().unrecoverable();
        match err {
            DeployError::Unrecoverable(inner) => {
                assert!(matches!(*inner, DeployError::Internal(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn classification_sees_through_context() {
        let err = DeployError::Placement("no capacity".to_owned()).context("updating machine");
        assert!(err.is_placement());
        assert!(!err.is_retryable());
        assert!(!err.is_unrecoverable());

        let err = DeployError::transient("502 bad gateway").context("listing machines");
        assert!(err.is_retryable());
    }

    #[test]
    fn lease_conflicts_and_cancellation_are_unrecoverable() {
        let conflict = DeployError::LeaseConflict {
            machine_id: MachineId::new("m1"),
            message: "lease currently held".to_owned(),
        };
        assert!(conflict.is_unrecoverable());
        assert!(DeployError::Cancelled.is_unrecoverable());
        assert!(DeployError::Aggregate(vec![
            DeployError::internal("a"),
            DeployError::Cancelled
        ])
        .is_unrecoverable());
        assert!(!DeployError::validation("bad").is_unrecoverable());
    }

    #[test]
    fn wait_timeout_suggests_region_for_started() {
        let err = DeployError::WaitTimeout {
            machine_id: MachineId::new("m1"),
            timeout: Duration::from_secs(300),
            desired_state: "started".to_owned(),
        };
        let suggestion = err.suggestion().unwrap();
        assert!(suggestion.contains("different region"));
        assert!(suggestion.contains("wait_timeout_secs"));
        assert!(err.to_string().contains("5m"));
    }

    #[test]
    fn blue_green_stage_is_found_under_context() {
        let err = DeployError::BlueGreen {
            stage: BlueGreenStage::WaitForHealthy,
            source: Box::new(DeployError::internal("unhealthy")),
        }
        .context("deploying");
        assert_eq!(err.blue_green_stage(), Some(BlueGreenStage::WaitForHealthy));
        assert!(BlueGreenStage::WaitForHealthy.rolls_back_green());
        assert!(!BlueGreenStage::DestroyBlueMachines.rolls_back_green());
    }
}
