//! Execution status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall disposition of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The pipeline ran to a terminal outcome.
    Run,
    /// Every step was bypassed via the skip signal.
    Skip,
    /// The pipeline was suspended by a pause signal.
    Stop,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Run
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Skip => write!(f, "skip"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// The persisted status of a single step within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The step has started and not yet finished.
    Running,
    /// The step finished and its result was recorded.
    Complete,
    /// The step failed.
    Error,
    /// The step was bypassed via the skip signal.
    Skipped,
    /// No status information is available.
    Unknown,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl StepStatus {
    /// Returns true when a restart may skip re-executing the step.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// The persisted status of a whole session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// The run is in progress.
    Running,
    /// The run finished successfully.
    Complete,
    /// The run surfaced a failure.
    Error,
    /// The run was suspended by a pause signal.
    Paused,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
            Self::Paused => write!(f, "PAUSED"),
        }
    }
}
