//! Error types for the stepflow execution core.
//!
//! The taxonomy distinguishes genuine failures from control signals:
//! [`FlowError::Pause`] and [`FlowError::Skip`] steer the executor and are
//! never reported as pipeline failures.

use thiserror::Error;

use crate::context::StateKey;

/// Message used when a failure carries no cause message of its own.
pub const UNKNOWN_EXCEPTION_MESSAGE: &str = "An unknown exception has occurred";

/// The main error type for stepflow operations.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// A required pipeline input was not supplied as a global or parameter.
    #[error("Required parameter '{name}' missing for pipeline '{pipeline}'")]
    RequiredParameterMissing {
        /// The input parameter name.
        name: String,
        /// The pipeline declaring the input.
        pipeline: String,
    },

    /// A parameter value could not be coerced to its declared type.
    #[error("Parameter '{name}' cannot be coerced to {expected}: {value}")]
    ParameterType {
        /// The parameter name.
        name: String,
        /// The declared type.
        expected: String,
        /// The offending value, rendered for diagnostics.
        value: String,
    },

    /// A step body raised an exception.
    #[error("Step invocation failed: {message}")]
    StepInvocation {
        /// The failure message.
        message: String,
        /// The execution position at the time of failure.
        state: Option<StateKey>,
    },

    /// A branch step's result matched no outgoing edge.
    #[error("No branch edge matches result '{value}' on step '{step}'")]
    BranchNoMatch {
        /// The branch step id.
        step: String,
        /// The unmatched result value.
        value: String,
    },

    /// A step-group referenced a pipeline id with no registered definition.
    #[error("Pipeline '{id}' not found")]
    PipelineNotFound {
        /// The missing pipeline id.
        id: String,
    },

    /// A routing target named a step that does not exist.
    #[error("Step '{id}' not found")]
    UnknownStep {
        /// The missing step id.
        id: String,
    },

    /// Every fork slot failed; carries the per-slot errors.
    #[error("Fork failed: {}", .errors.join("; "))]
    Forked {
        /// Per-slot error messages, labelled by slot index.
        errors: Vec<String>,
    },

    /// Every split branch failed; carries the per-branch errors.
    #[error("Split failed: {}", .errors.join("; "))]
    Split {
        /// Per-branch error messages, labelled by branch name.
        errors: Vec<String>,
    },

    /// Orderly suspension requested by a step. Not a failure.
    #[error("Pipeline paused: {message}")]
    Pause {
        /// The checkpoint message supplied by the step.
        message: String,
    },

    /// Skip the current step and continue at `next`. Not a failure.
    #[error("Step execution skipped")]
    Skip,

    /// A session store or converter operation failed.
    #[error("Session store error: {message}")]
    Session {
        /// The failure message.
        message: String,
    },

    /// The pipeline definition violates a structural invariant.
    #[error("Invalid pipeline: {message}")]
    InvalidPipeline {
        /// The violation description.
        message: String,
    },
}

impl FlowError {
    /// Creates a step invocation failure at the given position.
    #[must_use]
    pub fn invocation(message: impl Into<String>, state: Option<StateKey>) -> Self {
        Self::StepInvocation {
            message: message.into(),
            state,
        }
    }

    /// Creates a pause signal.
    #[must_use]
    pub fn pause(message: impl Into<String>) -> Self {
        Self::Pause {
            message: message.into(),
        }
    }

    /// Creates a session store error.
    #[must_use]
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Creates a pipeline validation error.
    #[must_use]
    pub fn invalid_pipeline(message: impl Into<String>) -> Self {
        Self::InvalidPipeline {
            message: message.into(),
        }
    }

    /// Returns true for the pause signal.
    #[must_use]
    pub fn is_pause(&self) -> bool {
        matches!(self, Self::Pause { .. })
    }

    /// Returns true for the skip signal.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }

    /// Returns true for control signals that must never be retried or
    /// reported as failures.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        self.is_pause() || self.is_skip()
    }

    /// Renders the cause message stored for error-handler steps.
    ///
    /// Invocation failures yield the underlying cause; anything without
    /// a message falls back to [`UNKNOWN_EXCEPTION_MESSAGE`].
    #[must_use]
    pub fn handler_message(&self) -> String {
        let message = match self {
            Self::StepInvocation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if message.trim().is_empty() {
            UNKNOWN_EXCEPTION_MESSAGE.to_string()
        } else {
            message
        }
    }

    /// Wraps an error into a step invocation failure unless it is already
    /// one, or a control signal.
    #[must_use]
    pub fn into_invocation(self, state: Option<StateKey>) -> Self {
        match self {
            Self::StepInvocation { .. } | Self::Pause { .. } | Self::Skip => self,
            other => Self::StepInvocation {
                message: other.to_string(),
                state,
            },
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Session {
            message: err.to_string(),
        }
    }
}
