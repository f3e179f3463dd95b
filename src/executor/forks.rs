//! Fork and split orchestration.
//!
//! A fork iterates its child sub-sequence over a resolved list, one
//! isolated slot per element, converging at the matching join. A split
//! evaluates named branch sub-sequences concurrently, converging at the
//! matching merge. Slots and branches share a read-only input snapshot
//! and produce independent output snapshots merged in index order.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{persist, save_audit_for, DriveSuccess, PipelineExecutor, Segment, SegmentSignal};
use crate::context::{ExecutionContext, ForkData, StateKey};
use crate::core::{AuditType, ExecutionAudit, StepResponse, StepStatus};
use crate::errors::FlowError;
use crate::pipeline::{FlowStep, ForkMethod, StepKind};
use crate::utils::now_millis;

/// Global capping the number of concurrent fork workers.
///
/// Absent, the bound is one worker per slot.
pub const FORK_PARALLELISM_GLOBAL: &str = "forkJoin.parallelism";

fn find_matching_join(steps: &[FlowStep], fork_rel: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, step) in steps[fork_rel + 1..].iter().enumerate() {
        match &step.kind {
            StepKind::Fork { .. } => depth += 1,
            StepKind::Join => {
                if depth == 0 {
                    return Some(fork_rel + 1 + offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

fn find_matching_merge(steps: &[FlowStep], split_rel: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, step) in steps[split_rel + 1..].iter().enumerate() {
        match &step.kind {
            StepKind::Split => depth += 1,
            StepKind::Merge => {
                if depth == 0 {
                    return Some(split_rel + 1 + offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// The primary return of the last step a slot executed.
fn slot_primary(done: &DriveSuccess) -> Value {
    done.last
        .as_ref()
        .and_then(|key| done.ctx.step_result(key))
        .and_then(|response| response.primary.clone())
        .unwrap_or(Value::Null)
}

/// Executes a fork step; returns the merged context, the step after the
/// join, and the join's state key.
pub(super) async fn execute_fork(
    segment: &Segment,
    fork_rel: usize,
    step: &FlowStep,
    key: &StateKey,
    values_expression: &str,
    method: ForkMethod,
    mut ctx: ExecutionContext,
) -> Result<(ExecutionContext, Option<String>, StateKey), SegmentSignal> {
    let steps = segment.steps();
    let Some(join_rel) = find_matching_join(steps, fork_rel) else {
        let error =
            FlowError::invalid_pipeline(format!("fork step '{}' has no matching join", step.id));
        return Err(SegmentSignal::Failed(error, ctx));
    };
    let join_step = steps[join_rel].clone();
    let Some(slot_start) = step.next.clone() else {
        let error =
            FlowError::invalid_pipeline(format!("fork step '{}' has no child sequence", step.id));
        return Err(SegmentSignal::Failed(error, ctx));
    };

    let values = match ctx.mapper.resolve_expression(values_expression, &ctx) {
        Ok(Some(Value::Array(items))) => items,
        Ok(None) => Vec::new(),
        Ok(Some(other)) => {
            let error = FlowError::ParameterType {
                name: "forkByValues".to_string(),
                expected: "list".to_string(),
                value: other.to_string(),
            };
            return Err(SegmentSignal::Failed(error, ctx));
        }
        Err(error) => return Err(SegmentSignal::Failed(error, ctx)),
    };

    ctx.audits
        .upsert(ExecutionAudit::start(key.clone(), AuditType::Fork));
    save_audit_for(&ctx, key);
    persist(
        ctx.session
            .set_status(key, StepStatus::Running, vec![slot_start.clone()]),
        "step status",
    );
    debug!(fork = %step.id, slots = values.len(), ?method, "starting fork");

    let slot_segment = |index: usize, value: &Value| Segment {
        pipeline: segment.pipeline.clone(),
        lo: segment.lo + fork_rel + 1,
        hi: segment.lo + join_rel,
        terminal: Some(join_step.id.clone()),
        fork: Some(ForkData::new(&step.id, index, value.clone())),
        parent: segment.parent.clone(),
    };
    // Each slot sees the fork step's response as its own slot value, so
    // inner mappings can reference it by the fork step's id.
    let seed_slot = |slot: &Segment, value: &Value| {
        let seed_key = slot.key_for(step);
        let seed = StepResponse::of(value.clone());
        persist(ctx.session.save_result(&seed_key, &seed), "step result");
        ctx.clone().with_step_result(seed_key, seed)
    };

    let outcomes: Vec<(usize, Result<DriveSuccess, SegmentSignal>)> = match method {
        ForkMethod::Serial => {
            let mut collected = Vec::with_capacity(values.len());
            for (index, value) in values.iter().enumerate() {
                let slot = slot_segment(index, value);
                let slot_ctx = seed_slot(&slot, value);
                let outcome =
                    PipelineExecutor::drive(slot, slot_start.clone(), slot_ctx).await;
                collected.push((index, outcome));
            }
            collected
        }
        ForkMethod::Parallel => {
            let cap = ctx
                .global(FORK_PARALLELISM_GLOBAL)
                .and_then(Value::as_u64)
                .map(|n| usize::try_from(n.max(1)).unwrap_or(usize::MAX));
            let semaphore = cap.map(|permits| Arc::new(Semaphore::new(permits)));
            let mut workers: JoinSet<(usize, Result<DriveSuccess, SegmentSignal>)> =
                JoinSet::new();
            for (index, value) in values.iter().enumerate() {
                let slot = slot_segment(index, value);
                let slot_ctx = seed_slot(&slot, value);
                let start = slot_start.clone();
                let semaphore = semaphore.clone();
                workers.spawn(async move {
                    let _permit = match &semaphore {
                        Some(semaphore) => semaphore.acquire().await.ok(),
                        None => None,
                    };
                    (index, PipelineExecutor::drive(slot, start, slot_ctx).await)
                });
            }
            let mut collected = Vec::with_capacity(values.len());
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(outcome) => collected.push(outcome),
                    Err(join_error) => {
                        let error = FlowError::invocation(
                            format!("fork worker panicked: {join_error}"),
                            Some(key.clone()),
                        );
                        return Err(SegmentSignal::Failed(error, ctx));
                    }
                }
            }
            collected.sort_by_key(|(index, _)| *index);
            collected
        }
    };

    let total = values.len();
    let mut merged = ctx;
    let mut paused = false;
    let mut failures: Vec<String> = Vec::new();
    let mut primaries: Vec<Value> = Vec::new();
    for (index, outcome) in outcomes {
        match outcome {
            Ok(done) => {
                primaries.push(slot_primary(&done));
                merged = merged.merge(&done.ctx);
            }
            Err(SegmentSignal::Paused(slot_ctx)) => {
                merged = merged.merge(&slot_ctx);
                paused = true;
            }
            Err(SegmentSignal::Failed(error, slot_ctx)) => {
                merged = merged.merge(&slot_ctx);
                failures.push(format!("slot {index}: {error}"));
            }
        }
    }

    merged.audits.close(key, now_millis());
    save_audit_for(&merged, key);

    if paused {
        return Err(SegmentSignal::Paused(merged));
    }
    if total > 0 && failures.len() == total {
        persist(
            merged.session.set_status(key, StepStatus::Error, Vec::new()),
            "step status",
        );
        return Err(SegmentSignal::Failed(
            FlowError::Forked { errors: failures },
            merged,
        ));
    }

    persist(
        merged
            .session
            .set_status(key, StepStatus::Complete, vec![join_step.id.clone()]),
        "step status",
    );

    let mut join_response = StepResponse::of(Value::Array(primaries));
    if !failures.is_empty() {
        warn!(fork = %step.id, failed = failures.len(), "fork completed with partial failures");
        join_response = join_response.with_named(
            "errors",
            Value::Array(failures.into_iter().map(Value::String).collect()),
        );
    }

    let join_key = segment.key_for(&join_step);
    merged.audits.upsert(
        ExecutionAudit::start(join_key.clone(), AuditType::Step).complete(now_millis()),
    );
    save_audit_for(&merged, &join_key);
    persist(
        merged.session.save_result(&join_key, &join_response),
        "step result",
    );
    persist(
        merged.session.set_status(
            &join_key,
            StepStatus::Complete,
            join_step.next.clone().into_iter().collect(),
        ),
        "step status",
    );
    merged = merged.with_step_result(join_key.clone(), join_response);

    let next = join_step
        .next
        .clone()
        .or_else(|| steps.get(join_rel + 1).map(|s| s.id.clone()));
    Ok((merged, next, join_key))
}

/// Executes a split step; returns the merged context, the step after
/// the merge, and the merge's state key.
pub(super) async fn execute_split(
    segment: &Segment,
    split_rel: usize,
    step: &FlowStep,
    key: &StateKey,
    mut ctx: ExecutionContext,
) -> Result<(ExecutionContext, Option<String>, StateKey), SegmentSignal> {
    let steps = segment.steps();
    let Some(merge_rel) = find_matching_merge(steps, split_rel) else {
        let error =
            FlowError::invalid_pipeline(format!("split step '{}' has no matching merge", step.id));
        return Err(SegmentSignal::Failed(error, ctx));
    };
    let merge_step = steps[merge_rel].clone();
    let branches: Vec<(String, String)> = step
        .edges()
        .iter()
        .map(|(name, target)| ((*name).to_string(), (*target).to_string()))
        .collect();
    if branches.is_empty() {
        let error =
            FlowError::invalid_pipeline(format!("split step '{}' declares no branches", step.id));
        return Err(SegmentSignal::Failed(error, ctx));
    }

    ctx.audits
        .upsert(ExecutionAudit::start(key.clone(), AuditType::Fork));
    save_audit_for(&ctx, key);
    persist(
        ctx.session.set_status(
            key,
            StepStatus::Running,
            branches.iter().map(|(_, target)| target.clone()).collect(),
        ),
        "step status",
    );
    debug!(split = %step.id, branches = branches.len(), "starting split");

    let branch_segment = || Segment {
        pipeline: segment.pipeline.clone(),
        lo: segment.lo + split_rel + 1,
        hi: segment.lo + merge_rel,
        terminal: Some(merge_step.id.clone()),
        fork: segment.fork.clone(),
        parent: segment.parent.clone(),
    };

    let mut workers: JoinSet<(usize, Result<DriveSuccess, SegmentSignal>)> = JoinSet::new();
    for (index, (_, start)) in branches.iter().enumerate() {
        let branch = branch_segment();
        let start = start.clone();
        let branch_ctx = ctx.clone();
        workers.spawn(async move {
            (index, PipelineExecutor::drive(branch, start, branch_ctx).await)
        });
    }
    let mut outcomes = Vec::with_capacity(branches.len());
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_error) => {
                let error = FlowError::invocation(
                    format!("split worker panicked: {join_error}"),
                    Some(key.clone()),
                );
                return Err(SegmentSignal::Failed(error, ctx));
            }
        }
    }
    outcomes.sort_by_key(|(index, _)| *index);

    let mut merged = ctx;
    let mut paused = false;
    let mut failures: Vec<String> = Vec::new();
    let mut merge_response = StepResponse::none();
    for (index, outcome) in outcomes {
        let branch_name = &branches[index].0;
        match outcome {
            Ok(done) => {
                merge_response = merge_response.with_named(branch_name, slot_primary(&done));
                merged = merged.merge(&done.ctx);
            }
            Err(SegmentSignal::Paused(branch_ctx)) => {
                merged = merged.merge(&branch_ctx);
                paused = true;
            }
            Err(SegmentSignal::Failed(error, branch_ctx)) => {
                merged = merged.merge(&branch_ctx);
                failures.push(format!("branch {branch_name}: {error}"));
            }
        }
    }

    merged.audits.close(key, now_millis());
    save_audit_for(&merged, key);

    if paused {
        return Err(SegmentSignal::Paused(merged));
    }
    if failures.len() == branches.len() {
        persist(
            merged.session.set_status(key, StepStatus::Error, Vec::new()),
            "step status",
        );
        return Err(SegmentSignal::Failed(
            FlowError::Split { errors: failures },
            merged,
        ));
    }

    persist(
        merged
            .session
            .set_status(key, StepStatus::Complete, vec![merge_step.id.clone()]),
        "step status",
    );

    if !failures.is_empty() {
        warn!(split = %step.id, failed = failures.len(), "split completed with partial failures");
        merge_response = merge_response.with_named(
            "errors",
            Value::Array(failures.into_iter().map(Value::String).collect()),
        );
    }

    let merge_key = segment.key_for(&merge_step);
    merged.audits.upsert(
        ExecutionAudit::start(merge_key.clone(), AuditType::Step).complete(now_millis()),
    );
    save_audit_for(&merged, &merge_key);
    persist(
        merged.session.save_result(&merge_key, &merge_response),
        "step result",
    );
    persist(
        merged.session.set_status(
            &merge_key,
            StepStatus::Complete,
            merge_step.next.clone().into_iter().collect(),
        ),
        "step status",
    );
    merged = merged.with_step_result(merge_key.clone(), merge_response);

    let next = merge_step
        .next
        .clone()
        .or_else(|| steps.get(merge_rel + 1).map(|s| s.id.clone()));
    Ok((merged, next, merge_key))
}
