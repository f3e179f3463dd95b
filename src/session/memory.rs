//! In-memory and no-op session stores.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    AuditRecord, GlobalRecord, ResultRecord, SessionStore, SessionSummary, StatusRecord,
};
use crate::core::SessionStatus;
use crate::errors::FlowError;

/// A thread-safe in-memory session store.
///
/// Mirrors the upsert semantics of a relational row store: results key
/// on `(session, run, resultKey, name)`, statuses on
/// `(session, run, resultKey)`, audits on `(session, run, auditKey)`,
/// globals on `(session, run, name)`. Saving identical bytes under an
/// existing key is a no-op.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, SessionSummary>>,
    history: RwLock<Vec<SessionSummary>>,
    statuses: RwLock<Vec<StatusRecord>>,
    results: RwLock<Vec<ResultRecord>>,
    audits: RwLock<Vec<AuditRecord>>,
    globals: RwLock<Vec<GlobalRecord>>,
}

impl InMemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn start_session(
        &self,
        session_id: Uuid,
        run_id: i64,
        start: i64,
        status: SessionStatus,
    ) -> Result<(), FlowError> {
        let mut sessions = self.sessions.write();
        if let Some(previous) = sessions.remove(&session_id) {
            self.history.write().push(previous);
        }
        sessions.insert(
            session_id,
            SessionSummary {
                session_id,
                run_id,
                status,
                start,
                end: None,
            },
        );
        Ok(())
    }

    fn complete_session(
        &self,
        session_id: Uuid,
        end: i64,
        status: SessionStatus,
    ) -> Result<(), FlowError> {
        let mut sessions = self.sessions.write();
        let summary = sessions
            .get_mut(&session_id)
            .ok_or_else(|| FlowError::session(format!("unknown session {session_id}")))?;
        summary.end = Some(end);
        summary.status = status;
        Ok(())
    }

    fn session_history(&self, session_id: Uuid) -> Result<Vec<SessionSummary>, FlowError> {
        let mut rows: Vec<SessionSummary> = self
            .history
            .read()
            .iter()
            .filter(|summary| summary.session_id == session_id)
            .cloned()
            .collect();
        if let Some(live) = self.sessions.read().get(&session_id) {
            rows.push(live.clone());
        }
        rows.sort_by_key(|summary| summary.run_id);
        Ok(rows)
    }

    fn set_status(&self, record: StatusRecord) -> Result<(), FlowError> {
        let mut statuses = self.statuses.write();
        if let Some(existing) = statuses.iter_mut().find(|row| {
            row.session_id == record.session_id
                && row.run_id == record.run_id
                && row.result_key == record.result_key
        }) {
            *existing = record;
        } else {
            statuses.push(record);
        }
        Ok(())
    }

    fn load_statuses(&self, session_id: Uuid) -> Result<Vec<StatusRecord>, FlowError> {
        Ok(self
            .statuses
            .read()
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }

    fn save_step_result(&self, record: ResultRecord) -> Result<(), FlowError> {
        let mut results = self.results.write();
        if let Some(existing) = results.iter_mut().find(|row| {
            row.session_id == record.session_id
                && row.run_id == record.run_id
                && row.result_key == record.result_key
                && row.name == record.name
        }) {
            if existing.state == record.state {
                return Ok(());
            }
            *existing = record;
        } else {
            results.push(record);
        }
        Ok(())
    }

    fn load_step_results(&self, session_id: Uuid) -> Result<Vec<ResultRecord>, FlowError> {
        Ok(self
            .results
            .read()
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }

    fn save_audit(&self, record: AuditRecord) -> Result<(), FlowError> {
        let mut audits = self.audits.write();
        if let Some(existing) = audits.iter_mut().find(|row| {
            row.session_id == record.session_id
                && row.run_id == record.run_id
                && row.audit_key == record.audit_key
        }) {
            *existing = record;
        } else {
            audits.push(record);
        }
        Ok(())
    }

    fn load_audits(&self, session_id: Uuid) -> Result<Vec<AuditRecord>, FlowError> {
        Ok(self
            .audits
            .read()
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }

    fn save_global(&self, record: GlobalRecord) -> Result<(), FlowError> {
        let mut globals = self.globals.write();
        if let Some(existing) = globals.iter_mut().find(|row| {
            row.session_id == record.session_id
                && row.run_id == record.run_id
                && row.name == record.name
        }) {
            *existing = record;
        } else {
            globals.push(record);
        }
        Ok(())
    }

    fn load_globals(&self, session_id: Uuid) -> Result<Vec<GlobalRecord>, FlowError> {
        Ok(self
            .globals
            .read()
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }
}

/// A store that persists nothing. The default for detached executions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionStore;

impl SessionStore for NoopSessionStore {
    fn start_session(
        &self,
        _session_id: Uuid,
        _run_id: i64,
        _start: i64,
        _status: SessionStatus,
    ) -> Result<(), FlowError> {
        Ok(())
    }

    fn complete_session(
        &self,
        _session_id: Uuid,
        _end: i64,
        _status: SessionStatus,
    ) -> Result<(), FlowError> {
        Ok(())
    }

    fn session_history(&self, _session_id: Uuid) -> Result<Vec<SessionSummary>, FlowError> {
        Ok(Vec::new())
    }

    fn set_status(&self, _record: StatusRecord) -> Result<(), FlowError> {
        Ok(())
    }

    fn load_statuses(&self, _session_id: Uuid) -> Result<Vec<StatusRecord>, FlowError> {
        Ok(Vec::new())
    }

    fn save_step_result(&self, _record: ResultRecord) -> Result<(), FlowError> {
        Ok(())
    }

    fn load_step_results(&self, _session_id: Uuid) -> Result<Vec<ResultRecord>, FlowError> {
        Ok(Vec::new())
    }

    fn save_audit(&self, _record: AuditRecord) -> Result<(), FlowError> {
        Ok(())
    }

    fn load_audits(&self, _session_id: Uuid) -> Result<Vec<AuditRecord>, FlowError> {
        Ok(Vec::new())
    }

    fn save_global(&self, _record: GlobalRecord) -> Result<(), FlowError> {
        Ok(())
    }

    fn load_globals(&self, _session_id: Uuid) -> Result<Vec<GlobalRecord>, FlowError> {
        Ok(Vec::new())
    }
}
