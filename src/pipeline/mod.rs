//! Declarative pipeline definitions and their registry.

mod registry;
mod spec;

pub use registry::PipelineRegistry;
pub use spec::{
    FlowStep, ForkMethod, InputParameter, Parameter, ParameterKind, Pipeline, PipelineSettings,
    StepFunctionRef, StepKind,
};
