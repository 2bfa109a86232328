#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod cache;
mod context;
mod error;
mod graph;
mod model;
mod queue;
mod resolver;
mod task;
mod worker;

pub use crate::builder::{BuilderConfig, GraphBuilder};
pub use crate::error::BuildError;
pub use crate::graph::{DependencyGraph, DependencyNode};
pub use crate::model::{
    FunctionId, FunctionInvocation, Properties, Requirement, ResolvedValue, Specification,
    TargetRef,
};
pub use crate::resolver::{
    AvailabilityCheck, CandidateFunction, CandidateRejection, CountingSink, DiagnosticSink,
    FunctionResolver, NoRawInputs, RejectionReason, ResolutionFailure, Validation,
};
pub use crate::worker::{JobExecutor, RayonExecutor, ThreadExecutor};

/// Installs a plain `tracing` subscriber honoring `RUST_LOG`. Intended for
/// binaries and integration tests; libraries embedding the builder should
/// install their own subscriber instead.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
