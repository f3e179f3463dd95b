//! # Stepflow
//!
//! A declarative pipeline execution core.
//!
//! Stepflow drives pipelines described as data: ordered steps with
//! expression-mapped parameters, success/error routing, branching,
//! concurrent forks and splits, nested step-groups, and restartable
//! session persistence.
//!
//! - **Step state machine**: routing among `next`, `nextOnError`,
//!   branch edges, forks/joins, splits/merges, and step-groups
//! - **Parameter mapping**: a small expression language resolving step
//!   inputs from globals, prior responses, parameters, and credentials
//! - **Immutable contexts**: every mutation returns a new snapshot;
//!   fork slots merge their snapshots at the join
//! - **Sessions**: run-versioned persistence enabling pause/resume and
//!   restart without re-executing completed steps
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepflow::prelude::*;
//!
//! let pipeline = Pipeline::new("ingest")
//!     .with_step(
//!         FlowStep::function("fetch", StepFunctionRef::native("com.acme", "Http", "get"))
//!             .with_param(Parameter::mapping("url", "!sourceUrl"))
//!             .with_next("store"),
//!     )
//!     .with_step(
//!         FlowStep::function("store", StepFunctionRef::native("com.acme", "Db", "write"))
//!             .with_param(Parameter::mapping("rows", "@fetch")),
//!     );
//!
//! let result = PipelineExecutor::new().execute(&pipeline, context).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod context;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod executor;
pub mod mapper;
pub mod pipeline;
pub mod session;
pub mod steps;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{
        ExecutionContext, ForkData, PipelineParameter, StateKey, GLOBAL_LINKS_KEY,
    };
    pub use crate::core::{
        AuditLedger, AuditType, ExecutionAudit, RunStatus, SessionStatus, StepResponse,
        StepStatus,
    };
    pub use crate::credentials::{CredentialProvider, MapCredentialProvider, NoCredentials};
    pub use crate::errors::FlowError;
    pub use crate::events::{
        CollectingListener, CompositeListener, LoggingListener, NoopListener, PipelineListener,
    };
    pub use crate::executor::{
        ExecutionResult, PipelineExecutor, RetryPolicy, FORK_PARALLELISM_GLOBAL,
    };
    pub use crate::mapper::{ParameterMapper, LAST_STEP_ID_GLOBAL};
    pub use crate::pipeline::{
        FlowStep, ForkMethod, InputParameter, Parameter, ParameterKind, Pipeline,
        PipelineRegistry, PipelineSettings, StepFunctionRef, StepKind,
    };
    pub use crate::session::{
        ConverterRegistry, InMemorySessionStore, JsonConverter, NoopSessionStore,
        SessionContext, SessionStore, ValueConverter,
    };
    pub use crate::steps::{FnStep, ScriptEngine, StepFunction, StepRegistry};
    pub use crate::utils::{generate_uuid, iso_timestamp, now_millis};
}
