//! Declarative pipeline and step definitions.
//!
//! A [`Pipeline`] is an ordered sequence of [`FlowStep`]s. Steps are a
//! tagged variant over plain function invocations, branches, forks and
//! their joins, splits and their merges, and step-groups that invoke
//! another pipeline as a nested execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::errors::FlowError;

/// How fork slots are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkMethod {
    /// Slots run one after another.
    Serial,
    /// Slots run concurrently.
    Parallel,
}

impl Default for ForkMethod {
    fn default() -> Self {
        Self::Serial
    }
}

/// Declared type of a step parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParameterKind {
    /// Raw text; resolved values pass through uncoerced. The default.
    Text,
    /// Coerced string; scalars render, composites fail.
    String,
    /// 64-bit integer.
    Integer,
    /// Boolean.
    Boolean,
    /// 64-bit float.
    Double,
    /// Inline script source passed to a script engine.
    Script,
    /// Element-wise mapped list.
    List,
    /// Recursively mapped object.
    Object,
    /// A branch edge: the name matches a result, the value names the
    /// next step.
    Result,
    /// Any other declared type; values pass through unchanged.
    Unknown,
}

impl Default for ParameterKind {
    fn default() -> Self {
        Self::Text
    }
}

impl From<String> for ParameterKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "text" => Self::Text,
            "string" => Self::String,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "double" => Self::Double,
            "script" => Self::Script,
            "list" => Self::List,
            "object" => Self::Object,
            "result" => Self::Result,
            _ => Self::Unknown,
        }
    }
}

impl From<ParameterKind> for String {
    fn from(kind: ParameterKind) -> Self {
        match kind {
            ParameterKind::Text => "text",
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Double => "double",
            ParameterKind::Script => "script",
            ParameterKind::List => "list",
            ParameterKind::Object => "object",
            ParameterKind::Result => "result",
            ParameterKind::Unknown => "unknown",
        }
        .to_string()
    }
}

/// A single declared step parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// The parameter name.
    pub name: String,
    /// The declared type.
    #[serde(rename = "type", default)]
    pub kind: ParameterKind,
    /// Literal value or mapping expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Optional implementation class hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Optional refinement of the declared type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<String>,
}

impl Parameter {
    /// Creates a parameter with an explicit kind and value.
    #[must_use]
    pub fn typed(name: impl Into<String>, kind: ParameterKind, value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            value: Some(value),
            class_name: None,
            parameter_type: None,
        }
    }

    /// Creates a text parameter holding a mapping expression.
    #[must_use]
    pub fn mapping(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::typed(name, ParameterKind::Text, Value::String(expression.into()))
    }

    /// Creates a branch edge: `name` matches the step result, `target`
    /// names the next step.
    #[must_use]
    pub fn result(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::typed(name, ParameterKind::Result, Value::String(target.into()))
    }

    /// Returns true for branch-edge parameters.
    #[must_use]
    pub fn is_edge(&self) -> bool {
        self.kind == ParameterKind::Result
    }
}

/// A required or optional pipeline input declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    /// The input name.
    pub name: String,
    /// Whether the input is read from globals rather than pipeline
    /// parameters.
    #[serde(default)]
    pub global: bool,
    /// Whether execution fails when the input is absent.
    #[serde(default)]
    pub required: bool,
    /// Alternate names checked in order when the input is absent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<String>,
}

impl InputParameter {
    /// Creates an optional pipeline-parameter input.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Marks the input as read from globals.
    #[must_use]
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Marks the input as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the alternate names.
    #[must_use]
    pub fn with_alternates(mut self, alternates: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.alternates = alternates.into_iter().map(Into::into).collect();
        self
    }
}

/// Pipeline-level settings: inputs, output mapping, restartable steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Declared inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputParameter>,
    /// Mapping resolved on successful completion and stored under the
    /// pipeline's root key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Parameter>,
    /// Steps eligible as restart points.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub restartable_steps: HashSet<String>,
}

/// Reference to the implementation a step invokes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepFunctionRef {
    /// A native function addressed by `(package, object, function)`.
    Native {
        /// The package segment.
        package: String,
        /// The object segment.
        object: String,
        /// The function segment.
        function: String,
    },
    /// A scripted step delegated to the engine registered for
    /// `language`.
    Script {
        /// The script language.
        language: String,
    },
}

impl StepFunctionRef {
    /// Creates a native function reference.
    #[must_use]
    pub fn native(
        package: impl Into<String>,
        object: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self::Native {
            package: package.into(),
            object: object.into(),
            function: function.into(),
        }
    }

    /// Creates a scripted function reference.
    #[must_use]
    pub fn script(language: impl Into<String>) -> Self {
        Self::Script {
            language: language.into(),
        }
    }
}

/// The executable variant of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Invoke a native or scripted function, then route to `next`.
    Pipeline {
        /// The function to invoke.
        function: StepFunctionRef,
    },
    /// Invoke a function, then route on its primary return by matching a
    /// branch-edge parameter name.
    Branch {
        /// The function to invoke.
        function: StepFunctionRef,
    },
    /// Iterate the child sub-sequence over a resolved list.
    Fork {
        /// Mapping expression resolving to the list of slot values.
        values: String,
        /// Slot scheduling.
        #[serde(default)]
        method: ForkMethod,
    },
    /// Terminates a fork; receives slot responses ordered by index.
    Join,
    /// Evaluate named branch sub-sequences in parallel.
    Split,
    /// Terminates a split; gathers each branch's terminal result.
    Merge,
    /// Invoke another pipeline as a nested execution.
    Group {
        /// Mapping expression resolving to the pipeline id.
        pipeline: String,
    },
}

/// A single step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// The step id, unique within the pipeline.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Optional template the step was instantiated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_template_id: Option<String>,
    /// Declared parameters in invocation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Parameter>,
    /// The step to execute next on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// The step to route to when execution fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_on_error: Option<String>,
    /// Bypass expression: when it resolves non-empty the step is not
    /// invoked and the prior response at its key is reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_if_empty: Option<String>,
    /// Retry attempts on failure before surfacing the error.
    #[serde(default)]
    pub retry_limit: u32,
    /// The executable variant.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl FlowStep {
    fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            step_template_id: None,
            params: Vec::new(),
            next: None,
            next_on_error: None,
            execute_if_empty: None,
            retry_limit: 0,
            kind,
        }
    }

    /// Creates a function-invoking step.
    #[must_use]
    pub fn function(id: impl Into<String>, function: StepFunctionRef) -> Self {
        Self::new(id, StepKind::Pipeline { function })
    }

    /// Creates a branch step.
    #[must_use]
    pub fn branch(id: impl Into<String>, function: StepFunctionRef) -> Self {
        Self::new(id, StepKind::Branch { function })
    }

    /// Creates a fork step over a list mapping expression.
    #[must_use]
    pub fn fork(id: impl Into<String>, values: impl Into<String>, method: ForkMethod) -> Self {
        Self::new(
            id,
            StepKind::Fork {
                values: values.into(),
                method,
            },
        )
    }

    /// Creates the join terminating a fork.
    #[must_use]
    pub fn join(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Join)
    }

    /// Creates a split step; branch starts are declared as edge params.
    #[must_use]
    pub fn split(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Split)
    }

    /// Creates the merge terminating a split.
    #[must_use]
    pub fn merge(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Merge)
    }

    /// Creates a step-group step invoking another pipeline.
    #[must_use]
    pub fn group(id: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Group {
                pipeline: pipeline.into(),
            },
        )
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    /// Sets the success route.
    #[must_use]
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Sets the error route.
    #[must_use]
    pub fn with_next_on_error(mut self, next: impl Into<String>) -> Self {
        self.next_on_error = Some(next.into());
        self
    }

    /// Sets the bypass expression.
    #[must_use]
    pub fn with_execute_if_empty(mut self, expression: impl Into<String>) -> Self {
        self.execute_if_empty = Some(expression.into());
        self
    }

    /// Sets the retry limit.
    #[must_use]
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Branch edges declared on the step as `(name, target)` pairs.
    #[must_use]
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.params
            .iter()
            .filter(|p| p.is_edge())
            .filter_map(|p| {
                p.value
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(|target| (p.name.as_str(), target))
            })
            .collect()
    }
}

/// An ordered, declarative pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// The pipeline id, unique within a registry.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The ordered steps.
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inputs, output mapping, and restart configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PipelineSettings>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
            tags: Vec::new(),
            description: None,
            parameters: None,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Replaces the step sequence.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<FlowStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the pipeline settings.
    #[must_use]
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.parameters = Some(settings);
        self
    }

    /// Finds a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The declared inputs, empty when none are configured.
    #[must_use]
    pub fn inputs(&self) -> &[InputParameter] {
        self.parameters
            .as_ref()
            .map_or(&[], |settings| settings.inputs.as_slice())
    }

    /// The restartable step set, when configured.
    #[must_use]
    pub fn restartable_steps(&self) -> Option<&HashSet<String>> {
        self.parameters
            .as_ref()
            .map(|settings| &settings.restartable_steps)
            .filter(|steps| !steps.is_empty())
    }

    /// The output mapping, when configured.
    #[must_use]
    pub fn output_mapping(&self) -> Option<&Parameter> {
        self.parameters.as_ref().and_then(|s| s.output.as_ref())
    }

    /// Validates the structural invariants of the definition.
    ///
    /// Checks id uniqueness and encoding safety, success-route targets,
    /// branch and split edges, and fork/join plus split/merge pairing.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidPipeline`] describing the first
    /// violation found.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.id.is_empty() || self.id.contains('.') {
            return Err(FlowError::invalid_pipeline(format!(
                "pipeline id '{}' must be non-empty and must not contain '.'",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() || step.id.contains('.') {
                return Err(FlowError::invalid_pipeline(format!(
                    "step id '{}' must be non-empty and must not contain '.'",
                    step.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(FlowError::invalid_pipeline(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(next) = &step.next {
                if self.step(next).is_none() {
                    return Err(FlowError::invalid_pipeline(format!(
                        "step '{}' routes to unknown step '{next}'",
                        step.id
                    )));
                }
            }
            match &step.kind {
                StepKind::Branch { .. } | StepKind::Split => {
                    let edges = step.edges();
                    if edges.is_empty() {
                        return Err(FlowError::invalid_pipeline(format!(
                            "step '{}' declares no outgoing edges",
                            step.id
                        )));
                    }
                    for (name, target) in edges {
                        if self.step(target).is_none() {
                            return Err(FlowError::invalid_pipeline(format!(
                                "edge '{name}' of step '{}' targets unknown step '{target}'",
                                step.id
                            )));
                        }
                    }
                }
                StepKind::Fork { .. } => {
                    if step.next.is_none() {
                        return Err(FlowError::invalid_pipeline(format!(
                            "fork step '{}' has no child sequence",
                            step.id
                        )));
                    }
                }
                _ => {}
            }
        }

        // Fork/Join and Split/Merge must pair like brackets.
        let mut stack: Vec<(&str, bool)> = Vec::new();
        for step in &self.steps {
            match &step.kind {
                StepKind::Fork { .. } => stack.push((step.id.as_str(), true)),
                StepKind::Split => stack.push((step.id.as_str(), false)),
                StepKind::Join => match stack.pop() {
                    Some((_, true)) => {}
                    _ => {
                        return Err(FlowError::invalid_pipeline(format!(
                            "join step '{}' has no enclosing fork",
                            step.id
                        )))
                    }
                },
                StepKind::Merge => match stack.pop() {
                    Some((_, false)) => {}
                    _ => {
                        return Err(FlowError::invalid_pipeline(format!(
                            "merge step '{}' has no enclosing split",
                            step.id
                        )))
                    }
                },
                _ => {}
            }
        }
        if let Some((id, is_fork)) = stack.pop() {
            let wanted = if is_fork { "join" } else { "merge" };
            return Err(FlowError::invalid_pipeline(format!(
                "step '{id}' has no matching {wanted}"
            )));
        }

        Ok(())
    }
}
