//! Folding persisted records into restart data.
//!
//! When the same logical key carries records from multiple runs, the
//! record with the maximum run id wins.

use serde_json::Value;
use std::collections::HashMap;

use super::{SessionContext, PRIMARY_RESULT_NAME};
use crate::context::StateKey;
use crate::core::{StepResponse, StepStatus};
use crate::errors::FlowError;

/// Session state folded for a restart.
#[derive(Debug, Default)]
pub struct RestartData {
    /// Latest step responses by state key.
    pub results: HashMap<StateKey, StepResponse>,
    /// Latest step status by canonical state key.
    pub statuses: HashMap<String, StepStatus>,
    /// Latest persisted globals.
    pub globals: HashMap<String, Value>,
}

impl RestartData {
    /// Returns true when the session has no prior state at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.statuses.is_empty() && self.globals.is_empty()
    }

    /// The folded status for a state key.
    #[must_use]
    pub fn status_of(&self, key: &StateKey) -> StepStatus {
        self.statuses
            .get(&key.canonical())
            .copied()
            .unwrap_or_default()
    }
}

/// Loads and folds a session's persisted records.
///
/// # Errors
///
/// Returns [`FlowError::Session`] when the store cannot be read or a
/// codec fails. Records referencing unknown converters are skipped.
pub fn load_restart_data(session: &SessionContext) -> Result<RestartData, FlowError> {
    let converters = session.converters().clone();
    let store = session.store().clone();

    // (resultKey, name) -> record with the maximum run id.
    let mut latest: HashMap<(String, String), super::ResultRecord> = HashMap::new();
    for record in store.load_step_results(session.session_id)? {
        let slot = (record.result_key.clone(), record.name.clone());
        match latest.get(&slot) {
            Some(existing) if existing.run_id >= record.run_id => {}
            _ => {
                latest.insert(slot, record);
            }
        }
    }

    let mut results: HashMap<StateKey, StepResponse> = HashMap::new();
    for ((result_key, name), record) in latest {
        let Some(key) = StateKey::parse(&result_key) else {
            continue;
        };
        let Some(value) = converters.deserialize(&record.converter, &record.state)? else {
            continue;
        };
        let response = results.entry(key).or_default();
        if name == PRIMARY_RESULT_NAME {
            response.primary = Some(value);
        } else {
            response.named.insert(name, value);
        }
    }

    let mut statuses: HashMap<String, StepStatus> = HashMap::new();
    let mut status_runs: HashMap<String, i64> = HashMap::new();
    for record in store.load_statuses(session.session_id)? {
        let newer = status_runs
            .get(&record.result_key)
            .map_or(true, |run| record.run_id > *run);
        if newer {
            status_runs.insert(record.result_key.clone(), record.run_id);
            statuses.insert(record.result_key, record.status);
        }
    }

    let mut globals: HashMap<String, Value> = HashMap::new();
    let mut global_runs: HashMap<String, i64> = HashMap::new();
    for record in store.load_globals(session.session_id)? {
        let newer = global_runs
            .get(&record.name)
            .map_or(true, |run| record.run_id > *run);
        if newer {
            if let Some(value) = converters.deserialize(&record.converter, &record.state)? {
                global_runs.insert(record.name.clone(), record.run_id);
                globals.insert(record.name, value);
            }
        }
    }

    Ok(RestartData {
        results,
        statuses,
        globals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ConverterRegistry, InMemorySessionStore};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn session_pair() -> (Arc<InMemorySessionStore>, SessionContext) {
        let store = Arc::new(InMemorySessionStore::new());
        let session = SessionContext::new(
            store.clone(),
            Arc::new(ConverterRegistry::new()),
            Uuid::new_v4(),
            1,
        );
        (store, session)
    }

    fn key(step: &str) -> StateKey {
        StateKey::pipeline("p1").with_step(step)
    }

    #[test]
    fn test_empty_session_folds_empty() {
        let (_, session) = session_pair();
        let data = load_restart_data(&session).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_results_round_trip_through_fold() {
        let (_, session) = session_pair();
        let response = StepResponse::of(json!("value")).with_named("count", json!(2));
        session.save_result(&key("a"), &response).unwrap();

        let data = load_restart_data(&session).unwrap();
        let folded = data.results.get(&key("a")).unwrap();
        assert_eq!(folded.primary, Some(json!("value")));
        assert_eq!(folded.named.get("count"), Some(&json!(2)));
    }

    #[test]
    fn test_maximum_run_id_wins() {
        let (store, first_run) = session_pair();
        first_run
            .save_result(&key("a"), &StepResponse::of(json!("old")))
            .unwrap();
        first_run
            .set_status(&key("a"), StepStatus::Error, Vec::new())
            .unwrap();

        let second_run = SessionContext::new(
            store,
            Arc::new(ConverterRegistry::new()),
            first_run.session_id,
            2,
        );
        second_run
            .save_result(&key("a"), &StepResponse::of(json!("new")))
            .unwrap();
        second_run
            .set_status(&key("a"), StepStatus::Complete, Vec::new())
            .unwrap();

        let data = load_restart_data(&second_run).unwrap();
        assert_eq!(
            data.results.get(&key("a")).unwrap().primary,
            Some(json!("new"))
        );
        assert_eq!(data.status_of(&key("a")), StepStatus::Complete);
    }

    #[test]
    fn test_globals_fold() {
        let (_, session) = session_pair();
        session.save_global("region", &json!("us-east")).unwrap();

        let data = load_restart_data(&session).unwrap();
        assert_eq!(data.globals.get("region"), Some(&json!("us-east")));
    }

    #[test]
    fn test_unknown_status_for_unseen_key() {
        let (_, session) = session_pair();
        let data = load_restart_data(&session).unwrap();
        assert_eq!(data.status_of(&key("ghost")), StepStatus::Unknown);
    }
}
