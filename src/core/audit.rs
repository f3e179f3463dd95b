//! Per-state timing audits.
//!
//! Audits are inserted open on pipeline/step start and upserted with an
//! end time on finish. The ledger merges by canonical state key, latest
//! entry winning on collision.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::context::StateKey;
use crate::utils::now_millis;

/// The kind of execution position an audit covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditType {
    /// A whole pipeline execution.
    Pipeline,
    /// A single step execution.
    Step,
    /// A fork or split orchestration.
    Fork,
}

/// Timing and metrics for a single execution position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAudit {
    /// The execution position.
    pub key: StateKey,
    /// The kind of position.
    pub audit_type: AuditType,
    /// Start time, epoch milliseconds.
    pub start: i64,
    /// End time, epoch milliseconds; `None` while the audit is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Free-form metrics.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, Value>,
}

impl ExecutionAudit {
    /// Opens a new audit starting now.
    #[must_use]
    pub fn start(key: StateKey, audit_type: AuditType) -> Self {
        Self {
            key,
            audit_type,
            start: now_millis(),
            end: None,
            metrics: HashMap::new(),
        }
    }

    /// Closes the audit at the given end time.
    #[must_use]
    pub fn complete(mut self, end: i64) -> Self {
        self.end = Some(end);
        self
    }

    /// Adds a metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: Value) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Returns the duration in milliseconds when the end is known.
    #[must_use]
    pub fn duration(&self) -> Option<i64> {
        self.end.map(|end| end - self.start)
    }

    /// Returns true while no end time has been recorded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// An ordered collection of audits, upserted by canonical state key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLedger {
    entries: Vec<ExecutionAudit>,
}

impl AuditLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the audit for its state key.
    pub fn upsert(&mut self, audit: ExecutionAudit) {
        let canonical = audit.key.canonical();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|entry| entry.key.canonical() == canonical)
        {
            *existing = audit;
        } else {
            self.entries.push(audit);
        }
    }

    /// Finds the audit for a state key.
    #[must_use]
    pub fn find(&self, key: &StateKey) -> Option<&ExecutionAudit> {
        let canonical = key.canonical();
        self.entries
            .iter()
            .find(|entry| entry.key.canonical() == canonical)
    }

    /// Closes the audit for a key at the given end time, if present.
    pub fn close(&mut self, key: &StateKey, end: i64) {
        let canonical = key.canonical();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.key.canonical() == canonical)
        {
            entry.end = Some(end);
        }
    }

    /// Closes every open audit at the given end time.
    pub fn close_open(&mut self, end: i64) {
        for entry in self.entries.iter_mut().filter(|entry| entry.is_open()) {
            entry.end = Some(end);
        }
    }

    /// Upserts every audit from `incoming` into this ledger.
    pub fn merge(&mut self, incoming: &AuditLedger) {
        for audit in &incoming.entries {
            self.upsert(audit.clone());
        }
    }

    /// Iterates the audits in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionAudit> {
        self.entries.iter()
    }

    /// Returns the number of audits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
