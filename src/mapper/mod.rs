//! Parameter mapping expression language.
//!
//! A parameter's string value is resolved left-to-right against the
//! execution context. The leading character selects the source:
//!
//! | Prefix | Source |
//! |--------|--------|
//! | `!` | global (honoring `GlobalLinks` indirection) |
//! | `$` | prior step response, with `.primary`/`.namedKey` and dotted paths |
//! | `@` | prior step response primary |
//! | `#` | prior step response named returns |
//! | `&` | pipeline definition lookup |
//! | `?` | current-pipeline parameter |
//! | `%` | credential |
//! | none | literal, coerced per the declared type |
//!
//! `||` separates alternatives at the top level; the first non-empty
//! result wins. Alternatives bind looser than any prefix or dotted path.

use serde_json::{Map, Value};
use tracing::debug;

use crate::context::{ExecutionContext, StateKey};
use crate::core::StepResponse;
use crate::errors::FlowError;
use crate::pipeline::{Parameter, ParameterKind};

/// Global holding the id of the step that most recently failed.
///
/// Step references through this name resolve against the failed step, so
/// error-handler steps can read the failure with `@LastStepId`.
pub const LAST_STEP_ID_GLOBAL: &str = "LastStepId";

/// Which part of a step response a reference selects.
#[derive(Debug, Clone, Copy)]
enum Select {
    /// `@`: the primary return.
    Primary,
    /// `#`: the named-returns map.
    Named,
    /// `$`: explicit `.primary`/`.namedReturns`/named key, default primary.
    Path,
}

/// Resolves declared parameters against an execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterMapper;

impl ParameterMapper {
    /// Creates a mapper.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolves a declared parameter to its concrete value.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ParameterType`] when the resolved value
    /// cannot be coerced to the declared type.
    pub fn resolve(
        &self,
        param: &Parameter,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        let resolved = match &param.value {
            None => None,
            Some(value) => self.resolve_value(value, param.kind, ctx)?,
        };
        self.coerce(&param.name, param.kind, resolved)
    }

    /// Resolves a mapping expression without type coercion.
    ///
    /// # Errors
    ///
    /// Propagates failures from nested resolution.
    pub fn resolve_expression(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        for token in expression.split("||") {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let resolved = self.resolve_token(token, ctx)?;
            if !is_empty_value(resolved.as_ref()) {
                return Ok(resolved);
            }
        }
        Ok(None)
    }

    fn resolve_value(
        &self,
        value: &Value,
        kind: ParameterKind,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        match kind {
            // Script sources and routing edges are never treated as
            // expressions.
            ParameterKind::Script | ParameterKind::Result => Ok(Some(value.clone())),
            ParameterKind::List | ParameterKind::Object => self.resolve_element(value, ctx),
            _ => match value {
                Value::String(expression) => self.resolve_expression(expression, ctx),
                other => Ok(Some(other.clone())),
            },
        }
    }

    fn resolve_element(
        &self,
        value: &Value,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        match value {
            Value::String(expression) => self.resolve_expression(expression, ctx),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve_element(item, ctx)?.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(resolved)))
            }
            Value::Object(map) => {
                let mut resolved = Map::new();
                for (name, item) in map {
                    resolved.insert(
                        name.clone(),
                        self.resolve_element(item, ctx)?.unwrap_or(Value::Null),
                    );
                }
                Ok(Some(Value::Object(resolved)))
            }
            other => Ok(Some(other.clone())),
        }
    }

    fn resolve_token(
        &self,
        token: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        let mut chars = token.chars();
        match chars.next() {
            Some('!') => self.resolve_global(chars.as_str(), ctx),
            Some('$') => self.resolve_step_reference(chars.as_str(), Select::Path, ctx),
            Some('@') => self.resolve_step_reference(chars.as_str(), Select::Primary, ctx),
            Some('#') => self.resolve_step_reference(chars.as_str(), Select::Named, ctx),
            Some('&') => self.resolve_pipeline(chars.as_str(), ctx),
            Some('?') => self.resolve_pipeline_parameter(chars.as_str(), ctx),
            Some('%') => Ok(ctx.credentials.named_credential(chars.as_str())),
            _ => Ok(Some(Value::String(token.to_string()))),
        }
    }

    fn resolve_global(
        &self,
        body: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        let (name, path) = split_head(body);
        if let Some(link) = ctx.global_link(name) {
            debug!(global = name, link, "following global link");
            let base = self.resolve_expression(link, ctx)?;
            return Ok(walk_path(base, path));
        }
        Ok(walk_path(ctx.global(name).cloned(), path))
    }

    fn resolve_pipeline_parameter(
        &self,
        body: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        let (name, path) = split_head(body);
        let Some(pipeline_id) = ctx
            .current_state
            .as_ref()
            .map(|state| state.pipeline_id.clone())
        else {
            return Ok(None);
        };
        let value = ctx
            .pipeline_parameters(&pipeline_id)
            .and_then(|params| params.get(name))
            .cloned();
        Ok(walk_path(value, path))
    }

    fn resolve_pipeline(
        &self,
        id: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        match ctx.pipelines.get(id) {
            Some(pipeline) => Ok(Some(serde_json::to_value(pipeline)?)),
            None => Ok(None),
        }
    }

    fn resolve_step_reference(
        &self,
        body: &str,
        select: Select,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, FlowError> {
        let substituted;
        let body = if body == LAST_STEP_ID_GLOBAL || body.starts_with("LastStepId.") {
            match ctx.global_str(LAST_STEP_ID_GLOBAL) {
                Some(actual) => {
                    substituted =
                        format!("{actual}{}", &body[LAST_STEP_ID_GLOBAL.len()..]);
                    substituted.as_str()
                }
                None => return Ok(None),
            }
        } else {
            body
        };

        let segments: Vec<&str> = body.split('.').collect();

        // Longest canonical-key prefix wins over a bare step-id scan.
        for take in (1..=segments.len()).rev() {
            let candidate = segments[..take].join(".");
            if let Some(key) = StateKey::parse(&candidate) {
                if let Some(response) = ctx.step_result(&key) {
                    return Ok(select_response(response, &segments[take..], select));
                }
            }
        }

        let step_id = segments[0];
        let path = &segments[1..];

        // Inside a fork slot, a step reference resolves against this
        // slot before the cross-slot scan.
        if let Some(current) = &ctx.current_state {
            if current.fork.is_some() {
                let mut slot_key = current.clone();
                slot_key.step_id = Some(step_id.to_string());
                if let Some(response) = ctx.step_result(&slot_key) {
                    return Ok(select_response(response, path, select));
                }
            }
        }

        let hits = ctx.step_results_by_id(step_id);
        if hits.is_empty() {
            return Ok(None);
        }
        let forked = hits.iter().any(|(key, _)| key.fork.is_some());
        if forked {
            let items: Vec<Value> = hits
                .iter()
                .map(|(_, response)| {
                    select_response(response, path, select).unwrap_or(Value::Null)
                })
                .collect();
            Ok(Some(Value::Array(items)))
        } else {
            Ok(select_response(hits[0].1, path, select))
        }
    }

    fn coerce(
        &self,
        name: &str,
        kind: ParameterKind,
        value: Option<Value>,
    ) -> Result<Option<Value>, FlowError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let coerced = match kind {
            ParameterKind::Integer => match &value {
                Value::Number(n) if n.as_i64().is_some() => value,
                Value::String(s) => match s.trim().parse::<i64>() {
                    Ok(parsed) => Value::from(parsed),
                    Err(_) => return Err(type_error(name, "integer", &value)),
                },
                _ => return Err(type_error(name, "integer", &value)),
            },
            ParameterKind::Boolean => match &value {
                Value::Bool(_) => value,
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => return Err(type_error(name, "boolean", &value)),
                },
                _ => return Err(type_error(name, "boolean", &value)),
            },
            ParameterKind::Double => match &value {
                Value::Number(_) => value,
                Value::String(s) => match s.trim().parse::<f64>() {
                    Ok(parsed) => serde_json::Number::from_f64(parsed)
                        .map(Value::Number)
                        .ok_or_else(|| type_error(name, "double", &value))?,
                    Err(_) => return Err(type_error(name, "double", &value)),
                },
                _ => return Err(type_error(name, "double", &value)),
            },
            ParameterKind::String => match &value {
                Value::String(_) | Value::Null => value,
                Value::Number(_) | Value::Bool(_) => {
                    Value::String(value.to_string())
                }
                _ => return Err(type_error(name, "string", &value)),
            },
            _ => value,
        };
        Ok(Some(coerced))
    }
}

fn type_error(name: &str, expected: &str, value: &Value) -> FlowError {
    FlowError::ParameterType {
        name: name.to_string(),
        expected: expected.to_string(),
        value: value.to_string(),
    }
}

fn split_head(body: &str) -> (&str, Option<&str>) {
    match body.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (body, None),
    }
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn named_to_value(response: &StepResponse) -> Option<Value> {
    let map: Map<String, Value> = response
        .named
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(Value::Object(map))
}

fn select_response(response: &StepResponse, path: &[&str], select: Select) -> Option<Value> {
    match select {
        Select::Primary => walk_segments(response.primary.clone(), path),
        Select::Named => walk_segments(named_to_value(response), path),
        Select::Path => match path.first() {
            Some(&"primary") => walk_segments(response.primary.clone(), &path[1..]),
            Some(&"namedReturns") => walk_segments(named_to_value(response), &path[1..]),
            Some(segment) if response.named.contains_key(*segment) => {
                walk_segments(response.named.get(*segment).cloned(), &path[1..])
            }
            _ => walk_segments(response.primary.clone(), path),
        },
    }
}

fn walk_path(value: Option<Value>, path: Option<&str>) -> Option<Value> {
    match path {
        None => value,
        Some(path) => {
            let segments: Vec<&str> = path.split('.').collect();
            walk_segments(value, &segments)
        }
    }
}

fn walk_segments(value: Option<Value>, path: &[&str]) -> Option<Value> {
    let mut current = value?;
    for segment in path {
        current = match current {
            Value::Object(mut map) => map.remove(*segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.into_iter().nth(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
