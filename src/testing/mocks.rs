//! Mock step functions with invocation accounting.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::StepResponse;
use crate::errors::FlowError;
use crate::steps::StepRegistry;

/// Shared invocation and concurrency accounting for mock steps.
#[derive(Debug, Default)]
pub struct MockAccounting {
    invocations: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAccounting {
    /// Creates empty accounting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of times a mock was invoked.
    #[must_use]
    pub fn invocations(&self, name: &str) -> usize {
        self.invocations.lock().get(name).copied().unwrap_or(0)
    }

    /// The highest number of mocks running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, name: &str) -> usize {
        let mut invocations = self.invocations.lock();
        let count = invocations.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn enter(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn as_i64(value: &Value) -> i64 {
    value.as_i64().unwrap_or_default()
}

/// Registers the standard mock set under `flow.Common.*`.
pub fn register_mocks(registry: &StepRegistry, accounting: Arc<MockAccounting>) {
    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "echo", move |args, _ctx| {
        counting.record("echo");
        Ok(StepResponse::of(args.first().cloned().unwrap_or(Value::Null)))
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "timesTen", move |args, _ctx| {
        counting.record("timesTen");
        let n = args.first().map(as_i64).unwrap_or_default();
        Ok(StepResponse::of(json!(n * 10)))
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "failAlways", move |_args, ctx| {
        counting.record("failAlways");
        Err(FlowError::invocation(
            "deliberate failure",
            ctx.current_state.clone(),
        ))
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "failTwiceThenSucceed", move |_args, ctx| {
        let attempt = counting.record("failTwiceThenSucceed");
        if attempt <= 2 {
            Err(FlowError::invocation(
                format!("transient failure {attempt}"),
                ctx.current_state.clone(),
            ))
        } else {
            Ok(StepResponse::of(json!("recovered")))
        }
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "skip", move |_args, _ctx| {
        counting.record("skip");
        Err(FlowError::Skip)
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "pause", move |_args, _ctx| {
        counting.record("pause");
        Err(FlowError::pause("checkpoint"))
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "failOnOdd", move |args, ctx| {
        counting.record("failOnOdd");
        let n = args.first().map(as_i64).unwrap_or_default();
        if n % 2 == 0 {
            Ok(StepResponse::of(json!(n)))
        } else {
            Err(FlowError::invocation(
                format!("odd value {n}"),
                ctx.current_state.clone(),
            ))
        }
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "pauseOnOdd", move |args, _ctx| {
        counting.record("pauseOnOdd");
        let n = args.first().map(as_i64).unwrap_or_default();
        if n % 2 == 0 {
            Ok(StepResponse::of(json!(n)))
        } else {
            Err(FlowError::pause(format!("paused on {n}")))
        }
    });

    let counting = accounting.clone();
    registry.register_fn("flow", "Common", "trackConcurrency", move |args, _ctx| {
        counting.record("trackConcurrency");
        counting.enter();
        std::thread::sleep(Duration::from_millis(25));
        counting.exit();
        Ok(StepResponse::of(args.first().cloned().unwrap_or(Value::Null)))
    });

    let counting = accounting;
    registry.register_fn("flow", "Common", "setGlobal", move |args, _ctx| {
        counting.record("setGlobal");
        let name = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or("unnamed")
            .to_string();
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        Ok(StepResponse::of(json!("done")).with_named(format!("$globals.{name}"), value))
    });
}
