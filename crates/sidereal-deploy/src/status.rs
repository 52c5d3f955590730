//! Progress reporting for in-flight machines.

use std::fmt;

use tracing::info;

/// Coarse status of one progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Running,
    Success,
    Failure,
}

impl LineStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sink for per-machine progress lines.
///
/// Each in-flight machine owns one line index for the duration of a stage.
pub trait StatusSink: Send + Sync {
    /// Report the status of the given line.
    fn log_status(&self, line: usize, status: LineStatus, message: &str);
}

/// Status sink that emits progress lines as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn log_status(&self, line: usize, status: LineStatus, message: &str) {
        info!(line, status = %status, "{message}");
    }
}
