//! External interfaces consumed by the builder.
//!
//! The builder never knows anything about concrete producing functions. It
//! talks to a [`FunctionResolver`] to enumerate ordered candidates for a
//! requirement, to each [`CandidateFunction`] for declared inputs and
//! late-binding validation, to an [`AvailabilityCheck`] for raw/leaf inputs,
//! and to a [`DiagnosticSink`] for resolution failures.
//!
//! Collaborator methods return `anyhow::Result` so implementations may fail
//! with whatever error type suits them; such failures count as infrastructure
//! faults, which fail the owning task and are merged into the build's fault
//! tally without stopping unrelated branches.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{FunctionId, Requirement, ResolvedValue, Specification};

/// Outcome of a candidate function's late-binding validation, once all of its
/// declared inputs have been resolved.
#[derive(Debug, Clone)]
pub enum Validation {
    /// The candidate commits: here is the concrete output specification.
    Accept(Specification),
    /// The candidate rejects the resolved inputs; backtracking continues.
    Reject(String),
    /// The candidate needs more inputs before it can decide. The new
    /// requirements are resolved and validation runs again with them appended.
    Demand(Vec<Requirement>),
}

/// A candidate producing function, as surfaced by the catalogue.
///
/// Candidates are consulted in the order the [`FunctionResolver`] returns
/// them; that order is the priority order and the first fully validated
/// candidate wins.
pub trait CandidateFunction: Send + Sync {
    /// Catalogue identity of this function.
    fn id(&self) -> FunctionId;

    /// Candidates sharing an exclusion group are mutually exclusive along a
    /// recursion path: once one is committed by an ancestor, the others are
    /// skipped without being tried.
    fn exclusion_group(&self) -> Option<&str> {
        None
    }

    /// The inputs this function declares up front for the given requirement.
    /// May be empty, in which case validation runs immediately.
    fn inputs(&self, requirement: &Requirement) -> anyhow::Result<Vec<Requirement>>;

    /// Late-binding validation against the actual resolved inputs.
    ///
    /// `inputs` aligns with the requirements returned by [`Self::inputs`];
    /// `additional` aligns with the concatenation of every
    /// [`Validation::Demand`] issued so far for this attempt.
    fn validate(
        &self,
        requirement: &Requirement,
        inputs: &[Arc<ResolvedValue>],
        additional: &[Arc<ResolvedValue>],
    ) -> anyhow::Result<Validation>;

    /// Concurrency gate, held only for the duration of a [`validate`] call,
    /// never across waits on inputs. A `false` return means the function is
    /// contended right now; the task is parked on the deferred queue and
    /// retried later without consuming the attempt.
    ///
    /// [`validate`]: Self::validate
    fn try_acquire(&self) -> bool {
        true
    }

    /// Releases the gate taken by [`Self::try_acquire`]. Called exactly once
    /// per successful acquisition, whether the attempt succeeded or not.
    fn release(&self) {}
}

/// Enumerates candidate functions for a requirement, best first.
pub trait FunctionResolver: Send + Sync {
    fn candidates(
        &self,
        requirement: &Requirement,
    ) -> anyhow::Result<Vec<Arc<dyn CandidateFunction>>>;
}

/// Decides whether a requirement is satisfiable directly from raw data,
/// short-circuiting the candidate search with a leaf value.
pub trait AvailabilityCheck: Send + Sync {
    /// `Some(spec)` means the requirement resolves to a raw input described
    /// by `spec` (whose function id names the sourcing function).
    fn available(&self, requirement: &Requirement) -> Option<Specification>;
}

/// An availability check that never matches; every requirement goes through
/// the candidate search.
#[derive(Debug, Default)]
pub struct NoRawInputs;

impl AvailabilityCheck for NoRawInputs {
    fn available(&self, _requirement: &Requirement) -> Option<Specification> {
        None
    }
}

/// Why a particular candidate was rejected during the search.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RejectionReason {
    #[error("input could not be resolved: {0}")]
    UnresolvedInput(Requirement),
    #[error("validation rejected: {0}")]
    Validation(String),
    #[error("additional input could not be resolved: {0}")]
    UnresolvedAdditional(Requirement),
    #[error("requirement already under resolution on this path")]
    Recursive,
    #[error("exclusion group '{0}' already committed by an ancestor")]
    Excluded(String),
    #[error("resolved value rejected by a downstream consumer")]
    RejectedDownstream,
    #[error("dependency cycle detected at quiescence")]
    DependencyCycle,
    #[error("collaborator fault: {0}")]
    Fault(String),
}

/// One rejected candidate, with the reason. `function` is `None` for faults
/// that struck before any candidate was selected (e.g. the catalogue itself
/// failing).
#[derive(Debug, Clone)]
pub struct CandidateRejection {
    pub function: Option<FunctionId>,
    pub reason: RejectionReason,
}

impl fmt::Display for CandidateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}: {}", function, self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Full provenance of an exhausted resolution: the requirement, every
/// candidate attempted with its rejection reason, and the recursion path that
/// led here (innermost first).
#[derive(Debug, Clone)]
pub struct ResolutionFailure {
    pub requirement: Requirement,
    pub attempts: Vec<CandidateRejection>,
    pub ancestors: Vec<Requirement>,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to resolve {}", self.requirement)?;
        for attempt in &self.attempts {
            write!(f, "\n  tried {attempt}")?;
        }
        for ancestor in &self.ancestors {
            write!(f, "\n  required by {ancestor}")?;
        }
        Ok(())
    }
}

/// Receives resolution failures for top-level requirements.
///
/// Failures of nested requirements are folded into the parent's provenance
/// rather than reported individually.
pub trait DiagnosticSink: Send + Sync {
    fn resolution_failed(&self, failure: &ResolutionFailure);
}

/// The default sink: counts failures and otherwise stays quiet.
#[derive(Debug, Default)]
pub struct CountingSink {
    failures: AtomicU64,
}

impl CountingSink {
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl DiagnosticSink for CountingSink {
    fn resolution_failed(&self, failure: &ResolutionFailure) {
        tracing::debug!("resolution failed: {failure}");
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetRef;

    #[test]
    fn counting_sink_counts() {
        let sink = CountingSink::default();
        let failure = ResolutionFailure {
            requirement: Requirement::new(TargetRef::new("t"), "Price"),
            attempts: Vec::new(),
            ancestors: Vec::new(),
        };
        sink.resolution_failed(&failure);
        sink.resolution_failed(&failure);
        assert_eq!(sink.failures(), 2);
    }

    #[test]
    fn failure_display_includes_provenance() {
        let failure = ResolutionFailure {
            requirement: Requirement::new(TargetRef::new("t"), "Price"),
            attempts: vec![CandidateRejection {
                function: Some(FunctionId::new("f")),
                reason: RejectionReason::Validation("wrong currency".into()),
            }],
            ancestors: vec![Requirement::new(TargetRef::new("t"), "Pv")],
        };
        let text = failure.to_string();
        assert!(text.contains("Price"));
        assert!(text.contains("wrong currency"));
        assert!(text.contains("required by"));
    }
}
