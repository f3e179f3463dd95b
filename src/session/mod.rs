//! Session persistence façade.
//!
//! A session groups logically related executions under a UUID; each
//! invocation bumps the run id, which is stamped onto every persisted
//! record. Readers fold records with maximum-run-id-wins so restarts see
//! the latest completed state.

mod converters;
mod memory;
mod recovery;

pub use converters::{ConverterRegistry, JsonConverter, ValueConverter};
pub use memory::{InMemorySessionStore, NoopSessionStore};
pub use recovery::{load_restart_data, RestartData};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::context::StateKey;
use crate::core::{ExecutionAudit, SessionStatus, StepResponse, StepStatus};
use crate::errors::FlowError;
use crate::utils::now_millis;

/// Record name under which a primary return is persisted.
pub const PRIMARY_RESULT_NAME: &str = "primaryKey";

/// A session run summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// The session id.
    pub session_id: Uuid,
    /// The run id.
    pub run_id: i64,
    /// The run status.
    pub status: SessionStatus,
    /// Start time, epoch milliseconds.
    pub start: i64,
    /// End time, epoch milliseconds, when finished.
    pub end: Option<i64>,
}

impl SessionSummary {
    /// The run duration in milliseconds, when finished.
    #[must_use]
    pub fn duration(&self) -> Option<i64> {
        self.end.map(|end| end - self.start)
    }
}

/// A persisted step status row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// The session id.
    pub session_id: Uuid,
    /// Record time, epoch milliseconds.
    pub date: i64,
    /// The run id.
    pub run_id: i64,
    /// Canonical state key of the step.
    pub result_key: String,
    /// The step status.
    pub status: StepStatus,
    /// Step ids the step routes to, for diagnostics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
}

/// A persisted step result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The session id.
    pub session_id: Uuid,
    /// Record time, epoch milliseconds.
    pub date: i64,
    /// The run id.
    pub run_id: i64,
    /// Serialized value bytes.
    pub state: Vec<u8>,
    /// Name of the converter that produced the bytes.
    pub converter: String,
    /// Canonical state key of the producing step.
    pub result_key: String,
    /// [`PRIMARY_RESULT_NAME`] for the primary return, the named-return
    /// key otherwise.
    pub name: String,
}

/// A persisted audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// The session id.
    pub session_id: Uuid,
    /// Record time, epoch milliseconds.
    pub date: i64,
    /// The run id.
    pub run_id: i64,
    /// Serialized audit bytes.
    pub state: Vec<u8>,
    /// Name of the converter that produced the bytes.
    pub converter: String,
    /// Canonical state key of the audit.
    pub audit_key: String,
}

/// A persisted global row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRecord {
    /// The session id.
    pub session_id: Uuid,
    /// Record time, epoch milliseconds.
    pub date: i64,
    /// The run id.
    pub run_id: i64,
    /// Serialized value bytes.
    pub state: Vec<u8>,
    /// Name of the converter that produced the bytes.
    pub converter: String,
    /// The global name.
    pub name: String,
}

/// Storage contract for session state.
///
/// Writers are idempotent: saving identical state bytes under an
/// existing key is a no-op. Implementations must be thread-safe.
pub trait SessionStore: Send + Sync {
    /// Starts a run, moving any existing live row to history first.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn start_session(
        &self,
        session_id: Uuid,
        run_id: i64,
        start: i64,
        status: SessionStatus,
    ) -> Result<(), FlowError>;

    /// Finalizes the live run with an end time and status.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn complete_session(
        &self,
        session_id: Uuid,
        end: i64,
        status: SessionStatus,
    ) -> Result<(), FlowError>;

    /// Returns all runs of a session, oldest first, live row last.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn session_history(&self, session_id: Uuid) -> Result<Vec<SessionSummary>, FlowError>;

    /// Upserts a step status on `(session, run, resultKey)`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn set_status(&self, record: StatusRecord) -> Result<(), FlowError>;

    /// Loads all status rows of a session across runs.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn load_statuses(&self, session_id: Uuid) -> Result<Vec<StatusRecord>, FlowError>;

    /// Upserts a step result on `(session, run, resultKey, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn save_step_result(&self, record: ResultRecord) -> Result<(), FlowError>;

    /// Loads all result rows of a session across runs.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn load_step_results(&self, session_id: Uuid) -> Result<Vec<ResultRecord>, FlowError>;

    /// Upserts an audit on `(session, run, auditKey)`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn save_audit(&self, record: AuditRecord) -> Result<(), FlowError>;

    /// Loads all audit rows of a session across runs.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn load_audits(&self, session_id: Uuid) -> Result<Vec<AuditRecord>, FlowError>;

    /// Upserts a global on `(session, run, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn save_global(&self, record: GlobalRecord) -> Result<(), FlowError>;

    /// Loads all global rows of a session across runs.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    fn load_globals(&self, session_id: Uuid) -> Result<Vec<GlobalRecord>, FlowError>;
}

/// Façade binding a store, converter registry, session id, and run id.
///
/// Every write stamps `(sessionId, runId, date)` onto the record.
#[derive(Clone)]
pub struct SessionContext {
    /// The session id.
    pub session_id: Uuid,
    /// The current run id.
    pub run_id: i64,
    store: Arc<dyn SessionStore>,
    converters: Arc<ConverterRegistry>,
}

impl SessionContext {
    /// Creates a façade with explicit ids.
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        converters: Arc<ConverterRegistry>,
        session_id: Uuid,
        run_id: i64,
    ) -> Self {
        Self {
            session_id,
            run_id,
            store,
            converters,
        }
    }

    /// Attaches to a session, bumping the run id past the stored history.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] when the history cannot be read.
    pub fn attach(
        store: Arc<dyn SessionStore>,
        converters: Arc<ConverterRegistry>,
        session_id: Uuid,
    ) -> Result<Self, FlowError> {
        let run_id = store
            .session_history(session_id)?
            .iter()
            .map(|summary| summary.run_id)
            .max()
            .map_or(1, |max| max + 1);
        Ok(Self::new(store, converters, session_id, run_id))
    }

    /// Creates a façade over a no-op store, for unpersisted executions.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(
            Arc::new(NoopSessionStore),
            Arc::new(ConverterRegistry::new()),
            Uuid::new_v4(),
            1,
        )
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// The converter registry.
    #[must_use]
    pub fn converters(&self) -> &Arc<ConverterRegistry> {
        &self.converters
    }

    /// Starts the run.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn start(&self, status: SessionStatus) -> Result<(), FlowError> {
        self.store
            .start_session(self.session_id, self.run_id, now_millis(), status)
    }

    /// Finalizes the run.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn complete(&self, status: SessionStatus) -> Result<(), FlowError> {
        self.store
            .complete_session(self.session_id, now_millis(), status)
    }

    /// Persists a step response: the primary under
    /// [`PRIMARY_RESULT_NAME`] and each named return under its key.
    ///
    /// Values no converter accepts are dropped with a warning; execution
    /// is never blocked by an unpersistable result.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn save_result(
        &self,
        key: &StateKey,
        response: &StepResponse,
    ) -> Result<(), FlowError> {
        let result_key = key.canonical();
        if let Some(primary) = &response.primary {
            self.save_result_value(&result_key, PRIMARY_RESULT_NAME, primary)?;
        }
        for (name, value) in &response.named {
            self.save_result_value(&result_key, name, value)?;
        }
        Ok(())
    }

    fn save_result_value(
        &self,
        result_key: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), FlowError> {
        let Some((converter, state)) = self.converters.serialize(value)? else {
            warn!(result_key, name, "dropping unpersistable step result value");
            return Ok(());
        };
        self.store.save_step_result(ResultRecord {
            session_id: self.session_id,
            date: now_millis(),
            run_id: self.run_id,
            state,
            converter,
            result_key: result_key.to_string(),
            name: name.to_string(),
        })
    }

    /// Persists a step status.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn set_status(
        &self,
        key: &StateKey,
        status: StepStatus,
        next_steps: Vec<String>,
    ) -> Result<(), FlowError> {
        self.store.set_status(StatusRecord {
            session_id: self.session_id,
            date: now_millis(),
            run_id: self.run_id,
            result_key: key.canonical(),
            status,
            next_steps,
        })
    }

    /// Persists an audit.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn save_audit(&self, audit: &ExecutionAudit) -> Result<(), FlowError> {
        let value = serde_json::to_value(audit)?;
        let Some((converter, state)) = self.converters.serialize(&value)? else {
            warn!(key = %audit.key, "dropping unpersistable audit");
            return Ok(());
        };
        self.store.save_audit(AuditRecord {
            session_id: self.session_id,
            date: now_millis(),
            run_id: self.run_id,
            state,
            converter,
            audit_key: audit.key.canonical(),
        })
    }

    /// Persists a global value.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Session`] on storage failure.
    pub fn save_global(&self, name: &str, value: &Value) -> Result<(), FlowError> {
        let Some((converter, state)) = self.converters.serialize(value)? else {
            warn!(global = name, "dropping unpersistable global");
            return Ok(());
        };
        self.store.save_global(GlobalRecord {
            session_id: self.session_id,
            date: now_millis(),
            run_id: self.run_id,
            state,
            converter,
            name: name.to_string(),
        })
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}
