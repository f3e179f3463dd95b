//! End-to-end pipeline execution scenarios.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use stepflow::prelude::*;
use stepflow::testing::fixtures::TestHarness;

fn echo(id: &str) -> FlowStep {
    FlowStep::function(id, StepFunctionRef::native("flow", "Common", "echo"))
}

fn key(pipeline: &str, step: &str) -> StateKey {
    StateKey::pipeline(pipeline).with_step(step)
}

async fn execute(pipeline: &Pipeline, ctx: ExecutionContext) -> ExecutionResult {
    PipelineExecutor::new().execute(pipeline, ctx).await
}

#[tokio::test]
async fn linear_success_records_every_step() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(
            echo("A")
                .with_param(Parameter::mapping("value", "RAW"))
                .with_next("B"),
        )
        .with_step(
            FlowStep::branch("B", StepFunctionRef::native("flow", "Common", "echo"))
                .with_param(Parameter::mapping("value", "@A"))
                .with_param(Parameter::result("RAW", "C")),
        )
        .with_step(echo("C").with_param(Parameter::mapping("value", "@A")));

    let result = execute(&pipeline, harness.context()).await;

    assert!(result.success);
    assert!(!result.paused);
    let mut keys: Vec<String> = result
        .context
        .step_results
        .keys()
        .map(StateKey::canonical)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["p1.A", "p1.B", "p1.C"]);
    assert_eq!(
        result.context.step_result(&key("p1", "C")).unwrap().primary,
        Some(json!("RAW"))
    );
}

#[tokio::test]
async fn error_redirect_runs_handler_with_cause_message() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(
            FlowStep::function("A", StepFunctionRef::native("flow", "Common", "failAlways"))
                .with_next_on_error("H"),
        )
        .with_step(echo("H").with_param(Parameter::mapping("ex", "@LastStepId")));

    let result = execute(&pipeline, harness.context()).await;

    assert!(result.success);
    assert_eq!(
        result.context.step_result(&key("p1", "H")).unwrap().primary,
        Some(json!("deliberate failure"))
    );
    // The failed step's key carries the cause message for the handler.
    assert_eq!(
        result.context.step_result(&key("p1", "A")).unwrap().primary,
        Some(json!("deliberate failure"))
    );
}

#[tokio::test]
async fn parallel_fork_converges_in_index_order() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(FlowStep::fork("F", "!items", ForkMethod::Parallel).with_next("S"))
        .with_step(
            FlowStep::function("S", StepFunctionRef::native("flow", "Common", "timesTen"))
                .with_param(Parameter::mapping("value", "@F")),
        )
        .with_step(FlowStep::join("J"));

    let ctx = harness.context().with_global("items", json!([1, 2, 3]));
    let result = execute(&pipeline, ctx).await;

    assert!(result.success);

    let slots = result.context.step_results_by_id("S");
    assert_eq!(slots.len(), 3);
    let mut group_ids: Vec<String> = Vec::new();
    let mut indices: Vec<usize> = Vec::new();
    for (slot_key, _) in &slots {
        let fork = slot_key.fork.as_ref().expect("slot keys carry fork data");
        group_ids.push(fork.id.clone());
        indices.push(fork.index);
    }
    group_ids.dedup();
    assert_eq!(group_ids, vec!["F".to_string()]);
    assert_eq!(indices, vec![0, 1, 2]);

    assert_eq!(
        result.context.step_result(&key("p1", "J")).unwrap().primary,
        Some(json!([10, 20, 30]))
    );
}

#[tokio::test]
async fn pause_suspends_with_closed_audits() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1").with_step(FlowStep::function(
        "A",
        StepFunctionRef::native("flow", "Common", "pause"),
    ));

    let result = execute(&pipeline, harness.context()).await;

    assert!(result.success);
    assert!(result.paused);
    assert_eq!(result.run_status, RunStatus::Stop);

    let root = StateKey::pipeline("p1");
    assert!(!result.context.audits.find(&root).unwrap().is_open());
    assert_eq!(harness.listener.count_of("step_exception"), 1);

    let history = harness.store.session_history(harness.session_id).unwrap();
    assert_eq!(history.last().unwrap().status, SessionStatus::Paused);
}

#[tokio::test]
async fn restart_skips_completed_steps_and_reloads_results() {
    let harness = TestHarness::new();

    // Prior run: A and B completed, C was running when the run died.
    let prior = SessionContext::new(
        harness.store.clone(),
        Arc::new(ConverterRegistry::new()),
        harness.session_id,
        1,
    );
    prior
        .save_result(&key("p1", "A"), &StepResponse::of(json!("a result")))
        .unwrap();
    prior
        .save_result(&key("p1", "B"), &StepResponse::of(json!("b result")))
        .unwrap();
    prior
        .set_status(&key("p1", "A"), StepStatus::Complete, vec!["B".to_string()])
        .unwrap();
    prior
        .set_status(&key("p1", "B"), StepStatus::Complete, vec!["C".to_string()])
        .unwrap();
    prior
        .set_status(&key("p1", "C"), StepStatus::Running, vec!["D".to_string()])
        .unwrap();

    let mut restartable = std::collections::HashSet::new();
    restartable.insert("C".to_string());
    restartable.insert("D".to_string());

    let pipeline = Pipeline::new("p1")
        .with_step(echo("A").with_param(Parameter::mapping("value", "fresh a")).with_next("B"))
        .with_step(echo("B").with_param(Parameter::mapping("value", "fresh b")).with_next("C"))
        .with_step(
            FlowStep::function("C", StepFunctionRef::native("flow", "Common", "timesTen"))
                .with_param(Parameter::typed("value", ParameterKind::Integer, json!(4)))
                .with_next("D"),
        )
        .with_step(
            FlowStep::function("D", StepFunctionRef::native("flow", "Common", "timesTen"))
                .with_param(Parameter::mapping("value", "@C")),
        )
        .with_settings(PipelineSettings {
            restartable_steps: restartable,
            ..Default::default()
        });

    let result = execute(&pipeline, harness.context_for_run(2)).await;

    assert!(result.success);
    // A and B were never re-invoked; their stored results were loaded.
    assert_eq!(harness.invocations("echo"), 0);
    assert_eq!(harness.invocations("timesTen"), 2);
    assert_eq!(
        result.context.step_result(&key("p1", "A")).unwrap().primary,
        Some(json!("a result"))
    );
    assert_eq!(
        result.context.step_result(&key("p1", "D")).unwrap().primary,
        Some(json!(400))
    );
}

#[tokio::test]
async fn global_mutation_flows_to_later_steps() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(
            FlowStep::function("A", StepFunctionRef::native("flow", "Common", "setGlobal"))
                .with_param(Parameter::mapping("name", "x"))
                .with_param(Parameter::typed("value", ParameterKind::Integer, json!(42)))
                .with_next("B"),
        )
        .with_step(echo("B").with_param(Parameter::mapping("value", "!x")));

    let result = execute(&pipeline, harness.context()).await;

    assert!(result.success);
    assert_eq!(result.context.global("x"), Some(&json!(42)));
    assert_eq!(
        result.context.step_result(&key("p1", "B")).unwrap().primary,
        Some(json!(42))
    );

    // The mutated global was persisted for future runs.
    let globals = harness.store.load_globals(harness.session_id).unwrap();
    assert!(globals.iter().any(|record| record.name == "x"));
}

#[tokio::test]
async fn execution_only_adds_step_results() {
    let harness = TestHarness::new();
    let seeded_key = key("other", "earlier");
    let ctx = harness
        .context()
        .with_step_result(seeded_key.clone(), StepResponse::of(json!("seeded")));

    let pipeline =
        Pipeline::new("p1").with_step(echo("A").with_param(Parameter::mapping("value", "x")));
    let result = execute(&pipeline, ctx.clone()).await;

    assert!(result.success);
    for existing in ctx.step_results.keys() {
        assert!(result.context.step_results.contains_key(existing));
    }
    assert_eq!(
        result.context.step_result(&seeded_key).unwrap().primary,
        Some(json!("seeded"))
    );
}

#[tokio::test]
async fn step_group_output_becomes_group_response() {
    let harness = TestHarness::new();
    harness.pipelines.register(
        Pipeline::new("child")
            .with_step(
                echo("work")
                    .with_param(Parameter::mapping("value", "?seed"))
                    .with_next("more"),
            )
            .with_step(echo("more").with_param(Parameter::mapping("value", "@work")))
            .with_settings(PipelineSettings {
                output: Some(Parameter::mapping("output", "@more")),
                ..Default::default()
            }),
    );

    let mut child_params = HashMap::new();
    child_params.insert("seed".to_string(), json!("planted"));

    let pipeline = Pipeline::new("p1")
        .with_step(FlowStep::group("G", "child").with_next("after"))
        .with_step(echo("after").with_param(Parameter::mapping("value", "@G")));

    let ctx = harness.context().with_pipeline_parameters("child", child_params);
    let result = execute(&pipeline, ctx).await;

    assert!(result.success);
    assert_eq!(
        result
            .context
            .step_result(&key("p1", "after"))
            .unwrap()
            .primary,
        Some(json!("planted"))
    );

    // The nested execution is keyed under the group step.
    let nested = key("child", "work").with_parent(key("p1", "G"));
    assert!(result.context.step_result(&nested).is_some());
}

#[tokio::test]
async fn scripted_step_runs_through_registered_engine() {
    use async_trait::async_trait;
    use stepflow::errors::FlowError;

    struct UppercaseEngine;

    #[async_trait]
    impl ScriptEngine for UppercaseEngine {
        fn language(&self) -> &str {
            "upper"
        }

        async fn evaluate(
            &self,
            source: &str,
            bindings: &HashMap<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<Value, FlowError> {
            let suffix = bindings
                .get("suffix")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Ok(Value::String(format!(
                "{}{suffix}",
                source.to_uppercase()
            )))
        }
    }

    let harness = TestHarness::new();
    harness.steps.register_engine(Arc::new(UppercaseEngine));

    let pipeline = Pipeline::new("p1").with_step(
        FlowStep::function("A", StepFunctionRef::script("upper"))
            .with_param(Parameter::typed(
                "body",
                ParameterKind::Script,
                json!("hello"),
            ))
            .with_param(Parameter::mapping("suffix", "!punct")),
    );

    let ctx = harness.context().with_global("punct", json!("!"));
    let result = execute(&pipeline, ctx).await;

    assert!(result.success);
    assert_eq!(
        result.context.step_result(&key("p1", "A")).unwrap().primary,
        Some(json!("HELLO!"))
    );
}

#[tokio::test]
async fn session_records_survive_execution() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(
            echo("A")
                .with_param(Parameter::mapping("value", "persisted"))
                .with_next("B"),
        )
        .with_step(echo("B").with_param(Parameter::mapping("value", "@A")));

    let result = execute(&pipeline, harness.context()).await;
    assert!(result.success);

    let results = harness.store.load_step_results(harness.session_id).unwrap();
    assert!(results.iter().any(|record| record.result_key == "p1.A"));
    assert!(results.iter().any(|record| record.result_key == "p1.B"));

    let statuses = harness.store.load_statuses(harness.session_id).unwrap();
    assert!(statuses
        .iter()
        .all(|record| record.status == StepStatus::Complete));

    let audits = harness.store.load_audits(harness.session_id).unwrap();
    assert!(audits.iter().any(|record| record.audit_key == "p1"));

    let history = harness.store.session_history(harness.session_id).unwrap();
    assert_eq!(history.last().unwrap().status, SessionStatus::Complete);
}

#[tokio::test]
async fn merge_is_idempotent_over_execution_results() {
    let harness = TestHarness::new();
    let pipeline =
        Pipeline::new("p1").with_step(echo("A").with_param(Parameter::mapping("value", "x")));
    let result = execute(&pipeline, harness.context()).await;

    let merged = result.context.clone().merge(&result.context);
    assert_eq!(merged.step_results, result.context.step_results);
    assert_eq!(merged.globals, result.context.globals);
    assert_eq!(merged.audits, result.context.audits);
}

#[tokio::test]
async fn state_keys_round_trip_for_every_result() {
    let harness = TestHarness::new();
    let pipeline = Pipeline::new("p1")
        .with_step(FlowStep::fork("F", "!items", ForkMethod::Serial).with_next("S"))
        .with_step(
            FlowStep::function("S", StepFunctionRef::native("flow", "Common", "timesTen"))
                .with_param(Parameter::mapping("value", "@F")),
        )
        .with_step(FlowStep::join("J"));

    let ctx = harness.context().with_global("items", json!([7, 8]));
    let result = execute(&pipeline, ctx).await;
    assert!(result.success);

    for state_key in result.context.step_results.keys() {
        let parsed = StateKey::parse(&state_key.canonical()).unwrap();
        assert_eq!(&parsed, state_key);
    }
}
