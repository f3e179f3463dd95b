//! The pipeline execution state machine.
//!
//! [`PipelineExecutor::execute`] drives a pipeline to completion:
//! resolving parameters, invoking step implementations, routing on
//! success and error, orchestrating forks and splits, recording audits
//! and session state, and honoring pause/skip signals. No error crosses
//! the executor boundary; every outcome is an [`ExecutionResult`].

mod forks;
mod retry;

pub use forks::FORK_PARALLELISM_GLOBAL;
pub use retry::RetryPolicy;

use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::{ExecutionContext, ForkData, StateKey, GLOBAL_LINKS_KEY};
use crate::core::{
    AuditType, ExecutionAudit, RunStatus, SessionStatus, StepResponse, StepStatus,
};
use crate::errors::FlowError;
use crate::mapper::LAST_STEP_ID_GLOBAL;
use crate::pipeline::{FlowStep, Pipeline, StepKind};
use crate::session::{load_restart_data, RestartData};
use crate::steps::ResolvedParameter;
use crate::utils::now_millis;

/// The terminal outcome of a pipeline execution.
#[derive(Debug)]
pub struct ExecutionResult {
    /// The final context snapshot.
    pub context: ExecutionContext,
    /// True unless a failure surfaced.
    pub success: bool,
    /// True when a pause signal suspended the pipeline.
    pub paused: bool,
    /// The surfaced failure, when `success` is false.
    pub error: Option<FlowError>,
    /// Overall disposition.
    pub run_status: RunStatus,
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A contiguous run of steps being driven: the whole pipeline, one fork
/// slot, or one split branch.
#[derive(Clone)]
pub(crate) struct Segment {
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) lo: usize,
    pub(crate) hi: usize,
    /// Step id that ends the segment (a join or merge), exclusive.
    pub(crate) terminal: Option<String>,
    /// Fork slot data applied to every key in the segment.
    pub(crate) fork: Option<ForkData>,
    /// Enclosing step-group key applied to every key in the segment.
    pub(crate) parent: Option<StateKey>,
}

impl Segment {
    fn steps(&self) -> &[FlowStep] {
        &self.pipeline.steps[self.lo..self.hi]
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.steps().iter().position(|step| step.id == id)
    }

    pub(crate) fn key_for(&self, step: &FlowStep) -> StateKey {
        let mut key = StateKey::pipeline(&self.pipeline.id).with_step(&step.id);
        if let Some(fork) = &self.fork {
            key = key.with_fork(fork.clone());
        }
        if let Some(parent) = &self.parent {
            key = key.with_parent(parent.clone());
        }
        key
    }
}

/// Control signal bubbling out of a segment drive.
pub(crate) enum SegmentSignal {
    /// A pause signal suspended execution; the context is preserved.
    Paused(ExecutionContext),
    /// A failure surfaced past every handler.
    Failed(FlowError, ExecutionContext),
}

/// A segment that ran to its end or terminal step.
pub(crate) struct DriveSuccess {
    pub(crate) ctx: ExecutionContext,
    pub(crate) all_skipped: bool,
    /// Key of the last step that produced a response.
    pub(crate) last: Option<StateKey>,
}

/// Drives declarative pipelines to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Executes a pipeline against a context.
    ///
    /// Starts the session run, selects the restart point when the
    /// session carries prior state, drives the step loop, and finalizes
    /// the session with the terminal status.
    pub async fn execute(&self, pipeline: &Pipeline, ctx: ExecutionContext) -> ExecutionResult {
        if let Err(error) = pipeline.validate() {
            return failed(ctx, error);
        }
        let pipeline = Arc::new(pipeline.clone());
        persist(ctx.session.start(SessionStatus::Running), "session start");

        let mut ctx = ctx;
        let mut start = None;
        if pipeline.restartable_steps().is_some() {
            match load_restart_data(&ctx.session) {
                Ok(data) if !data.statuses.is_empty() => {
                    start = select_restart_step(&pipeline, &data);
                    ctx = preload(ctx, data);
                    if let Some(step) = &start {
                        debug!(step = %step, "resuming session at restart point");
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "failed to load restart data"),
            }
        }

        let result = Self::run_pipeline(pipeline, ctx, None, start).await;

        let status = if result.paused {
            SessionStatus::Paused
        } else if result.success {
            SessionStatus::Complete
        } else {
            SessionStatus::Error
        };
        persist(result.context.session.complete(status), "session completion");
        result
    }

    /// Runs one pipeline: start notification, input validation, the
    /// step loop, output mapping, and finish notification.
    fn run_pipeline(
        pipeline: Arc<Pipeline>,
        ctx: ExecutionContext,
        parent: Option<StateKey>,
        start: Option<String>,
    ) -> BoxedFuture<ExecutionResult> {
        Box::pin(async move {
            let mut ctx = ctx;
            let mut root_key = StateKey::pipeline(&pipeline.id);
            if let Some(parent) = &parent {
                root_key = root_key.with_parent(parent.clone());
            }

            let listener = ctx.listener.clone();
            match listener.pipeline_started(&pipeline, &ctx).await {
                Ok(Some(updated)) => ctx = updated,
                Ok(None) => {}
                Err(error) => return failed(ctx, error),
            }

            ctx.audits
                .upsert(ExecutionAudit::start(root_key.clone(), AuditType::Pipeline));
            save_audit_for(&ctx, &root_key);

            if let Err(error) = validate_inputs(&pipeline, &ctx) {
                ctx.audits.close_open(now_millis());
                ctx.listener.clone().step_exception(&error, &ctx).await;
                return failed(ctx, error);
            }

            let Some(first) = start.or_else(|| pipeline.steps.first().map(|s| s.id.clone()))
            else {
                return Self::finish_pipeline(pipeline, ctx, root_key, true).await;
            };

            let segment = Segment {
                pipeline: pipeline.clone(),
                lo: 0,
                hi: pipeline.steps.len(),
                terminal: None,
                fork: None,
                parent,
            };

            match Self::drive(segment, first, ctx).await {
                Ok(done) => {
                    let mut ctx = done.ctx;
                    if let Some(mapping) = pipeline.output_mapping() {
                        ctx = ctx.with_current_state(root_key.clone());
                        match ctx.mapper.resolve(mapping, &ctx) {
                            Ok(Some(value)) => {
                                let response = StepResponse::of(value);
                                persist(
                                    ctx.session.save_result(&root_key, &response),
                                    "pipeline output",
                                );
                                ctx = ctx.with_step_result(root_key.clone(), response);
                            }
                            Ok(None) => {}
                            Err(error) => {
                                ctx.audits.close_open(now_millis());
                                ctx.listener.clone().step_exception(&error, &ctx).await;
                                return failed(ctx, error);
                            }
                        }
                    }
                    let run = !done.all_skipped || pipeline.steps.is_empty();
                    Self::finish_pipeline(pipeline, ctx, root_key, run).await
                }
                Err(SegmentSignal::Paused(mut ctx)) => {
                    ctx.audits.close(&root_key, now_millis());
                    save_audit_for(&ctx, &root_key);
                    ExecutionResult {
                        context: ctx,
                        success: true,
                        paused: true,
                        error: None,
                        run_status: RunStatus::Stop,
                    }
                }
                Err(SegmentSignal::Failed(error, mut ctx)) => {
                    ctx.audits.close_open(now_millis());
                    ExecutionResult {
                        context: ctx,
                        success: false,
                        paused: false,
                        error: Some(error),
                        run_status: RunStatus::Run,
                    }
                }
            }
        })
    }

    async fn finish_pipeline(
        pipeline: Arc<Pipeline>,
        mut ctx: ExecutionContext,
        root_key: StateKey,
        ran: bool,
    ) -> ExecutionResult {
        ctx.audits.close(&root_key, now_millis());
        save_audit_for(&ctx, &root_key);
        let listener = ctx.listener.clone();
        match listener.pipeline_finished(&pipeline, &ctx).await {
            Ok(Some(updated)) => ctx = updated,
            Ok(None) => {}
            Err(error) => return failed(ctx, error),
        }
        ExecutionResult {
            context: ctx,
            success: true,
            paused: false,
            error: None,
            run_status: if ran { RunStatus::Run } else { RunStatus::Skip },
        }
    }

    /// Drives a segment from `start` until it completes, reaches its
    /// terminal, pauses, or fails.
    pub(crate) fn drive(
        segment: Segment,
        start: String,
        ctx: ExecutionContext,
    ) -> BoxedFuture<Result<DriveSuccess, SegmentSignal>> {
        Box::pin(async move {
            let mut ctx = ctx;
            let mut current = start;
            let mut all_skipped = true;
            let mut last: Option<StateKey> = None;

            loop {
                if segment.terminal.as_deref() == Some(current.as_str()) {
                    return Ok(DriveSuccess {
                        ctx,
                        all_skipped,
                        last,
                    });
                }
                let Some(position) = segment.position(&current) else {
                    let error = FlowError::UnknownStep { id: current };
                    ctx.listener.clone().step_exception(&error, &ctx).await;
                    return Err(SegmentSignal::Failed(error, ctx));
                };
                let step = segment.steps()[position].clone();
                let key = segment.key_for(&step);
                ctx = ctx.with_current_state(key.clone());

                let listener = ctx.listener.clone();
                match listener.step_started(&step, &ctx).await {
                    Ok(Some(updated)) => ctx = updated,
                    Ok(None) => {}
                    Err(error) => return Err(SegmentSignal::Failed(error, ctx)),
                }

                ctx.audits
                    .upsert(ExecutionAudit::start(key.clone(), AuditType::Step));
                save_audit_for(&ctx, &key);
                persist(
                    ctx.session
                        .set_status(&key, StepStatus::Running, route_targets(&step)),
                    "step status",
                );

                // Bypass hook: a non-empty result reuses the prior
                // response at this key instead of invoking the step.
                if matches!(
                    step.kind,
                    StepKind::Pipeline { .. } | StepKind::Branch { .. } | StepKind::Group { .. }
                ) {
                    if let Some(expression) = &step.execute_if_empty {
                        match ctx.mapper.resolve_expression(expression, &ctx) {
                            Ok(Some(value)) => {
                                all_skipped = false;
                                let response = ctx
                                    .step_result(&key)
                                    .cloned()
                                    .unwrap_or_else(|| StepResponse::from_raw(value));
                                debug!(step = %step.id, "bypassing step with existing response");
                                match finish_step(&step, &key, response, ctx).await {
                                    Ok((updated, next)) => {
                                        ctx = updated;
                                        last = Some(key.clone());
                                        match next {
                                            Some(id) => {
                                                current = id;
                                                continue;
                                            }
                                            None => {
                                                return Ok(DriveSuccess {
                                                    ctx,
                                                    all_skipped,
                                                    last,
                                                })
                                            }
                                        }
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                match handle_failure(&segment, &step, &key, error, false, ctx)
                                    .await
                                {
                                    Ok((updated, redirect)) => {
                                        ctx = updated;
                                        current = redirect;
                                        continue;
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                        }
                    }
                }

                match &step.kind {
                    StepKind::Pipeline { function } | StepKind::Branch { function } => {
                        let mut args = Vec::new();
                        let mut mapper_error = None;
                        for param in step.params.iter().filter(|p| !p.is_edge()) {
                            match ctx.mapper.resolve(param, &ctx) {
                                Ok(value) => args.push(ResolvedParameter {
                                    name: param.name.clone(),
                                    kind: param.kind,
                                    value,
                                }),
                                Err(error) => {
                                    mapper_error = Some(error);
                                    break;
                                }
                            }
                        }
                        if let Some(error) = mapper_error {
                            match handle_failure(&segment, &step, &key, error, false, ctx).await
                            {
                                Ok((updated, redirect)) => {
                                    ctx = updated;
                                    current = redirect;
                                    continue;
                                }
                                Err(signal) => return Err(signal),
                            }
                        }

                        let policy = RetryPolicy::new(step.retry_limit);
                        let mut attempt = 0u32;
                        let outcome = loop {
                            match ctx.steps.invoke(function, &args, &ctx).await {
                                Ok(response) => break Ok(response),
                                Err(error) if error.is_signal() => break Err(error),
                                Err(error) => {
                                    if attempt >= policy.limit {
                                        break Err(error);
                                    }
                                    attempt += 1;
                                    debug!(step = %step.id, attempt, "retrying step");
                                    tokio::time::sleep(policy.delay(attempt)).await;
                                }
                            }
                        };

                        match outcome {
                            Ok(response) => {
                                all_skipped = false;
                                match finish_step(&step, &key, response, ctx).await {
                                    Ok((updated, next)) => {
                                        ctx = updated;
                                        last = Some(key.clone());
                                        match next {
                                            Some(id) => current = id,
                                            None => {
                                                return Ok(DriveSuccess {
                                                    ctx,
                                                    all_skipped,
                                                    last,
                                                })
                                            }
                                        }
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                            Err(error) if error.is_pause() => {
                                ctx.audits.close(&key, now_millis());
                                save_audit_for(&ctx, &key);
                                ctx.listener.clone().step_exception(&error, &ctx).await;
                                return Err(SegmentSignal::Paused(ctx));
                            }
                            Err(error) if error.is_skip() => {
                                persist(
                                    ctx.session.set_status(
                                        &key,
                                        StepStatus::Skipped,
                                        route_targets(&step),
                                    ),
                                    "step status",
                                );
                                ctx.audits.close(&key, now_millis());
                                save_audit_for(&ctx, &key);
                                match &step.next {
                                    Some(id) => current = id.clone(),
                                    None => {
                                        return Ok(DriveSuccess {
                                            ctx,
                                            all_skipped,
                                            last,
                                        })
                                    }
                                }
                            }
                            Err(error) => {
                                match handle_failure(&segment, &step, &key, error, false, ctx)
                                    .await
                                {
                                    Ok((updated, redirect)) => {
                                        ctx = updated;
                                        current = redirect;
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                        }
                    }
                    StepKind::Fork { values, method } => {
                        all_skipped = false;
                        match forks::execute_fork(
                            &segment, position, &step, &key, values, *method, ctx,
                        )
                        .await
                        {
                            Ok((merged, next, join_key)) => {
                                ctx = merged;
                                last = Some(join_key);
                                let listener = ctx.listener.clone();
                                match listener.step_finished(&step, &ctx).await {
                                    Ok(Some(updated)) => ctx = updated,
                                    Ok(None) => {}
                                    Err(error) => {
                                        return Err(SegmentSignal::Failed(error, ctx))
                                    }
                                }
                                match next {
                                    Some(id) => current = id,
                                    None => {
                                        return Ok(DriveSuccess {
                                            ctx,
                                            all_skipped,
                                            last,
                                        })
                                    }
                                }
                            }
                            Err(SegmentSignal::Paused(paused)) => {
                                return Err(SegmentSignal::Paused(paused))
                            }
                            Err(SegmentSignal::Failed(error, recovered)) => {
                                match handle_failure(
                                    &segment, &step, &key, error, false, recovered,
                                )
                                .await
                                {
                                    Ok((updated, redirect)) => {
                                        ctx = updated;
                                        current = redirect;
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                        }
                    }
                    StepKind::Split => {
                        all_skipped = false;
                        match forks::execute_split(&segment, position, &step, &key, ctx).await {
                            Ok((merged, next, merge_key)) => {
                                ctx = merged;
                                last = Some(merge_key);
                                let listener = ctx.listener.clone();
                                match listener.step_finished(&step, &ctx).await {
                                    Ok(Some(updated)) => ctx = updated,
                                    Ok(None) => {}
                                    Err(error) => {
                                        return Err(SegmentSignal::Failed(error, ctx))
                                    }
                                }
                                match next {
                                    Some(id) => current = id,
                                    None => {
                                        return Ok(DriveSuccess {
                                            ctx,
                                            all_skipped,
                                            last,
                                        })
                                    }
                                }
                            }
                            Err(SegmentSignal::Paused(paused)) => {
                                return Err(SegmentSignal::Paused(paused))
                            }
                            Err(SegmentSignal::Failed(error, recovered)) => {
                                match handle_failure(
                                    &segment, &step, &key, error, false, recovered,
                                )
                                .await
                                {
                                    Ok((updated, redirect)) => {
                                        ctx = updated;
                                        current = redirect;
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                        }
                    }
                    StepKind::Join | StepKind::Merge => {
                        // Convergence points are consumed by fork/split
                        // orchestration; a directly-driven one advances.
                        match &step.next {
                            Some(id) => current = id.clone(),
                            None => {
                                return Ok(DriveSuccess {
                                    ctx,
                                    all_skipped,
                                    last,
                                })
                            }
                        }
                    }
                    StepKind::Group {
                        pipeline: expression,
                    } => {
                        all_skipped = false;
                        let child = match ctx.mapper.resolve_expression(expression, &ctx) {
                            Ok(Some(Value::String(id))) => ctx
                                .pipelines
                                .get(&id)
                                .ok_or(FlowError::PipelineNotFound { id }),
                            Ok(Some(value @ Value::Object(_))) => {
                                serde_json::from_value::<Pipeline>(value)
                                    .map_err(|err| FlowError::invalid_pipeline(err.to_string()))
                            }
                            Ok(_) => Err(FlowError::PipelineNotFound {
                                id: expression.clone(),
                            }),
                            Err(error) => Err(error),
                        };
                        let child = match child.and_then(|child| {
                            child.validate().map(|()| child)
                        }) {
                            Ok(child) => child,
                            Err(error) => {
                                let fatal = matches!(
                                    error,
                                    FlowError::PipelineNotFound { .. }
                                        | FlowError::InvalidPipeline { .. }
                                );
                                match handle_failure(&segment, &step, &key, error, fatal, ctx)
                                    .await
                                {
                                    Ok((updated, redirect)) => {
                                        ctx = updated;
                                        current = redirect;
                                        continue;
                                    }
                                    Err(signal) => return Err(signal),
                                }
                            }
                        };

                        let child_id = child.id.clone();
                        let child_result = Self::run_pipeline(
                            Arc::new(child),
                            ctx.clone(),
                            Some(key.clone()),
                            None,
                        )
                        .await;
                        let ExecutionResult {
                            context: child_ctx,
                            success,
                            paused,
                            error,
                            ..
                        } = child_result;
                        ctx = ctx.merge(&child_ctx);
                        if paused {
                            return Err(SegmentSignal::Paused(ctx));
                        }
                        if !success {
                            let error = error.unwrap_or_else(|| {
                                FlowError::invocation(
                                    "step-group execution failed",
                                    Some(key.clone()),
                                )
                            });
                            match handle_failure(&segment, &step, &key, error, false, ctx).await
                            {
                                Ok((updated, redirect)) => {
                                    ctx = updated;
                                    current = redirect;
                                    continue;
                                }
                                Err(signal) => return Err(signal),
                            }
                        }

                        // Adopt the child's root response (its output
                        // mapping) as the group step's own response.
                        let child_root =
                            StateKey::pipeline(&child_id).with_parent(key.clone());
                        let response = ctx.step_result(&child_root).cloned().unwrap_or_default();
                        match finish_step(&step, &key, response, ctx).await {
                            Ok((updated, next)) => {
                                ctx = updated;
                                last = Some(key.clone());
                                match next {
                                    Some(id) => current = id,
                                    None => {
                                        return Ok(DriveSuccess {
                                            ctx,
                                            all_skipped,
                                            last,
                                        })
                                    }
                                }
                            }
                            Err(signal) => return Err(signal),
                        }
                    }
                }
            }
        })
    }
}

/// Stores a successful response, records status and audit, notifies the
/// listener, and computes the next step id.
async fn finish_step(
    step: &FlowStep,
    key: &StateKey,
    response: StepResponse,
    mut ctx: ExecutionContext,
) -> Result<(ExecutionContext, Option<String>), SegmentSignal> {
    persist(ctx.session.save_result(key, &response), "step result");
    persist(
        ctx.session
            .set_status(key, StepStatus::Complete, route_targets(step)),
        "step status",
    );
    ctx = ctx.with_step_result(key.clone(), response.clone());
    for (name, value) in response.global_updates() {
        persist(ctx.session.save_global(name, value), "global");
    }
    if response.global_link_updates().next().is_some() {
        if let Some(links) = ctx.global(GLOBAL_LINKS_KEY) {
            persist(ctx.session.save_global(GLOBAL_LINKS_KEY, links), "global");
        }
    }
    ctx.audits.close(key, now_millis());
    save_audit_for(&ctx, key);

    let listener = ctx.listener.clone();
    match listener.step_finished(step, &ctx).await {
        Ok(Some(updated)) => ctx = updated,
        Ok(None) => {}
        Err(error) => return Err(SegmentSignal::Failed(error, ctx)),
    }

    match route_on_success(step, &response) {
        Ok(next) => Ok((ctx, next)),
        Err(error) => {
            persist(
                ctx.session.set_status(key, StepStatus::Error, Vec::new()),
                "step status",
            );
            ctx.audits.close_open(now_millis());
            ctx.listener.clone().step_exception(&error, &ctx).await;
            Err(SegmentSignal::Failed(error, ctx))
        }
    }
}

/// Applies the error-propagation policy for a failed step.
///
/// Non-fatal failures with a valid `nextOnError` target store the cause
/// message as the failed step's response, set the `LastStepId` global,
/// and redirect. Everything else surfaces.
async fn handle_failure(
    segment: &Segment,
    step: &FlowStep,
    key: &StateKey,
    error: FlowError,
    fatal: bool,
    mut ctx: ExecutionContext,
) -> Result<(ExecutionContext, String), SegmentSignal> {
    persist(
        ctx.session.set_status(key, StepStatus::Error, Vec::new()),
        "step status",
    );
    ctx.audits.close(key, now_millis());
    save_audit_for(&ctx, key);

    let redirect = step
        .next_on_error
        .as_ref()
        .filter(|id| segment.position(id).is_some());
    match (fatal, redirect) {
        (false, Some(handler)) => {
            let response = StepResponse::of(Value::String(error.handler_message()));
            persist(ctx.session.save_result(key, &response), "step result");
            ctx = ctx.with_step_result(key.clone(), response);
            ctx = ctx.with_global(LAST_STEP_ID_GLOBAL, Value::String(step.id.clone()));
            debug!(step = %step.id, handler = %handler, "routing to error handler");
            Ok((ctx, handler.clone()))
        }
        _ => {
            ctx.audits.close_open(now_millis());
            ctx.listener.clone().step_exception(&error, &ctx).await;
            Err(SegmentSignal::Failed(error, ctx))
        }
    }
}

fn failed(ctx: ExecutionContext, error: FlowError) -> ExecutionResult {
    ExecutionResult {
        context: ctx,
        success: false,
        paused: false,
        error: Some(error),
        run_status: RunStatus::Run,
    }
}

/// Logs and swallows persistence failures; execution never blocks on
/// the session store.
pub(crate) fn persist(outcome: Result<(), FlowError>, what: &'static str) {
    if let Err(error) = outcome {
        warn!(%error, what, "session persistence failed");
    }
}

pub(crate) fn save_audit_for(ctx: &ExecutionContext, key: &StateKey) {
    if let Some(audit) = ctx.audits.find(key) {
        persist(ctx.session.save_audit(audit), "audit");
    }
}

fn route_targets(step: &FlowStep) -> Vec<String> {
    match &step.kind {
        StepKind::Branch { .. } | StepKind::Split => step
            .edges()
            .iter()
            .map(|(_, target)| (*target).to_string())
            .collect(),
        _ => step.next.clone().into_iter().collect(),
    }
}

/// Success routing: branches match their primary return against an edge
/// name case-insensitively; everything else follows `next`.
fn route_on_success(step: &FlowStep, response: &StepResponse) -> Result<Option<String>, FlowError> {
    match &step.kind {
        StepKind::Branch { .. } => {
            let rendered = match &response.primary {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            step.edges()
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&rendered))
                .map(|(_, target)| Some((*target).to_string()))
                .ok_or_else(|| FlowError::BranchNoMatch {
                    step: step.id.clone(),
                    value: rendered,
                })
        }
        _ => Ok(step.next.clone()),
    }
}

fn validate_inputs(pipeline: &Pipeline, ctx: &ExecutionContext) -> Result<(), FlowError> {
    for input in pipeline.inputs().iter().filter(|input| input.required) {
        let mut names = vec![input.name.as_str()];
        names.extend(input.alternates.iter().map(String::as_str));
        let found = names.iter().any(|name| {
            if input.global {
                ctx.globals.contains_key(*name)
            } else {
                ctx.pipeline_parameters(&pipeline.id)
                    .is_some_and(|params| params.contains_key(*name))
            }
        });
        if !found {
            return Err(FlowError::RequiredParameterMissing {
                name: input.name.clone(),
                pipeline: pipeline.id.clone(),
            });
        }
    }
    Ok(())
}

/// Chooses the restart step: the first not-`COMPLETE` step after the
/// latest `COMPLETE`, provided it is declared restartable.
fn select_restart_step(pipeline: &Pipeline, data: &RestartData) -> Option<String> {
    let restartable = pipeline.restartable_steps()?;
    let key_of = |step: &FlowStep| StateKey::pipeline(&pipeline.id).with_step(&step.id);
    let last_complete = pipeline
        .steps
        .iter()
        .rposition(|step| data.status_of(&key_of(step)).is_complete())?;
    let candidate = pipeline.steps[last_complete + 1..]
        .iter()
        .find(|step| !data.status_of(&key_of(step)).is_complete())?;
    restartable
        .contains(&candidate.id)
        .then(|| candidate.id.clone())
}

/// Loads folded session state into the context without clobbering
/// caller-supplied globals or results.
fn preload(mut ctx: ExecutionContext, data: RestartData) -> ExecutionContext {
    for (name, value) in data.globals {
        ctx.globals.entry(name).or_insert(value);
    }
    let mut results: Vec<(StateKey, StepResponse)> = data.results.into_iter().collect();
    results.sort_by_key(|(key, _)| key.canonical());
    for (key, response) in results {
        if ctx.step_result(&key).is_none() {
            ctx = ctx.with_step_result(key, response);
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Parameter, StepFunctionRef};
    use crate::testing::fixtures::{test_context, TestHarness};
    use serde_json::json;

    fn echo_step(id: &str) -> FlowStep {
        FlowStep::function(id, StepFunctionRef::native("flow", "Common", "echo"))
    }

    #[tokio::test]
    async fn test_linear_pipeline_executes_every_step() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1")
            .with_step(
                echo_step("a")
                    .with_param(Parameter::mapping("value", "start"))
                    .with_next("b"),
            )
            .with_step(echo_step("b").with_param(Parameter::mapping("value", "@a")));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        assert!(!result.paused);
        assert_eq!(result.run_status, RunStatus::Run);
        let key = StateKey::pipeline("p1").with_step("b");
        assert_eq!(
            result.context.step_result(&key).unwrap().primary,
            Some(json!("start"))
        );
    }

    #[tokio::test]
    async fn test_invalid_pipeline_fails_before_execution() {
        let pipeline = Pipeline::new("p1").with_step(echo_step("a").with_next("ghost"));
        let result = PipelineExecutor::new()
            .execute(&pipeline, test_context())
            .await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(FlowError::InvalidPipeline { .. })
        ));
    }

    #[tokio::test]
    async fn test_required_input_missing_fails() {
        let pipeline = Pipeline::new("p1")
            .with_step(echo_step("a"))
            .with_settings(crate::pipeline::PipelineSettings {
                inputs: vec![crate::pipeline::InputParameter::new("region")
                    .global()
                    .required()],
                ..Default::default()
            });

        let result = PipelineExecutor::new()
            .execute(&pipeline, test_context())
            .await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(FlowError::RequiredParameterMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_required_input_satisfied_by_alternate() {
        let pipeline = Pipeline::new("p1")
            .with_step(echo_step("a").with_param(Parameter::mapping("value", "ok")))
            .with_settings(crate::pipeline::PipelineSettings {
                inputs: vec![crate::pipeline::InputParameter::new("region")
                    .global()
                    .required()
                    .with_alternates(["zone"])],
                ..Default::default()
            });

        let harness = TestHarness::new();
        let ctx = harness.context().with_global("zone", json!("us-east"));
        let result = PipelineExecutor::new().execute(&pipeline, ctx).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_branch_routing() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1")
            .with_step(
                echo_step("a")
                    .with_param(Parameter::mapping("value", "LEFT"))
                    .with_next("b"),
            )
            .with_step(
                FlowStep::branch("b", StepFunctionRef::native("flow", "Common", "echo"))
                    .with_param(Parameter::mapping("value", "@a"))
                    .with_param(Parameter::result("left", "l"))
                    .with_param(Parameter::result("right", "r")),
            )
            .with_step(echo_step("l").with_param(Parameter::mapping("value", "went left")))
            .with_step(echo_step("r").with_param(Parameter::mapping("value", "went right")));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        let left = StateKey::pipeline("p1").with_step("l");
        let right = StateKey::pipeline("p1").with_step("r");
        assert!(result.context.step_result(&left).is_some());
        assert!(result.context.step_result(&right).is_none());
    }

    #[tokio::test]
    async fn test_branch_no_match_is_fatal() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1")
            .with_step(
                FlowStep::branch("b", StepFunctionRef::native("flow", "Common", "echo"))
                    .with_param(Parameter::mapping("value", "UNMATCHED"))
                    .with_param(Parameter::result("known", "k"))
                    .with_next_on_error("k"),
            )
            .with_step(echo_step("k"));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(FlowError::BranchNoMatch { .. })));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_failure() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1").with_step(
            FlowStep::function("a", StepFunctionRef::native("flow", "Common", "failAlways"))
                .with_retry_limit(2),
        );

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(!result.success);
        // First attempt plus two retries.
        assert_eq!(harness.invocations("failAlways"), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1").with_step(
            FlowStep::function(
                "a",
                StepFunctionRef::native("flow", "Common", "failTwiceThenSucceed"),
            )
            .with_retry_limit(3),
        );

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        assert_eq!(harness.invocations("failTwiceThenSucceed"), 3);
    }

    #[tokio::test]
    async fn test_skip_signal_advances_without_response() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1")
            .with_step(
                FlowStep::function("a", StepFunctionRef::native("flow", "Common", "skip"))
                    .with_next("b"),
            )
            .with_step(echo_step("b").with_param(Parameter::mapping("value", "ran")));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        let a = StateKey::pipeline("p1").with_step("a");
        let b = StateKey::pipeline("p1").with_step("b");
        assert!(result.context.step_result(&a).is_none());
        assert!(result.context.step_result(&b).is_some());
    }

    #[tokio::test]
    async fn test_all_steps_skipped_reports_skip_status() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1").with_step(FlowStep::function(
            "a",
            StepFunctionRef::native("flow", "Common", "skip"),
        ));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        assert_eq!(result.run_status, RunStatus::Skip);
    }

    #[tokio::test]
    async fn test_step_group_merges_child_results() {
        let harness = TestHarness::new();
        harness.pipelines.register(
            Pipeline::new("child")
                .with_step(echo_step("inner").with_param(Parameter::mapping("value", "from child"))),
        );

        let pipeline = Pipeline::new("p1")
            .with_step(FlowStep::group("g", "child").with_next("after"))
            .with_step(
                echo_step("after").with_param(Parameter::mapping("value", "@inner")),
            );

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        let group_key = StateKey::pipeline("p1").with_step("g");
        let inner = StateKey::pipeline("child")
            .with_step("inner")
            .with_parent(group_key);
        assert_eq!(
            result.context.step_result(&inner).unwrap().primary,
            Some(json!("from child"))
        );
        let after = StateKey::pipeline("p1").with_step("after");
        assert_eq!(
            result.context.step_result(&after).unwrap().primary,
            Some(json!("from child"))
        );
    }

    #[tokio::test]
    async fn test_missing_group_pipeline_is_fatal() {
        let harness = TestHarness::new();
        let pipeline =
            Pipeline::new("p1").with_step(FlowStep::group("g", "ghost").with_next_on_error("g"));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(FlowError::PipelineNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_if_empty_bypasses_invocation() {
        let harness = TestHarness::new();
        let pipeline = Pipeline::new("p1").with_step(
            FlowStep::function("a", StepFunctionRef::native("flow", "Common", "failAlways"))
                .with_execute_if_empty("!precomputed"),
        );

        let ctx = harness.context().with_global("precomputed", json!("cached"));
        let result = PipelineExecutor::new().execute(&pipeline, ctx).await;

        assert!(result.success);
        assert_eq!(harness.invocations("failAlways"), 0);
        let a = StateKey::pipeline("p1").with_step("a");
        assert_eq!(
            result.context.step_result(&a).unwrap().primary,
            Some(json!("cached"))
        );
    }

    #[tokio::test]
    async fn test_audits_are_closed_after_execution() {
        let harness = TestHarness::new();
        let pipeline =
            Pipeline::new("p1").with_step(echo_step("a").with_param(Parameter::mapping("value", "x")));

        let result = PipelineExecutor::new()
            .execute(&pipeline, harness.context())
            .await;

        assert!(result.success);
        assert!(result.context.audits.iter().all(|audit| !audit.is_open()));
        assert!(result.context.audits.len() >= 2);
    }
}
