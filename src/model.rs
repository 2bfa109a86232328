//! Core value model: requirements, specifications and resolved values.
//!
//! A [`Requirement`] is the question: "give me this value for this target,
//! subject to these constraints". A [`Specification`] is one concrete answer
//! shape, a particular output a particular function can produce. A
//! [`ResolvedValue`] is an answer together with the evidence that it can
//! actually be produced: the [`FunctionInvocation`] and its resolved inputs.
//!
//! All of these are immutable once created. Requirements and specifications
//! implement `Ord` so that map iteration over them is deterministic, which in
//! turn keeps the materialized graph independent of thread scheduling.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a computation target (an instrument, a curve, a position...).
///
/// Targets are opaque to the builder; only identity matters here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef(Arc<str>);

impl TargetRef {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a producing function in the external catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(Arc<str>);

impl FunctionId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of named properties, used both as requirement constraints and as the
/// resolved properties of a specification.
///
/// Backed by a sorted map so equality, hashing and iteration order are stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Properties(BTreeMap<Arc<str>, Arc<str>>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| &**v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (&**k, &**v))
    }

    /// Whether every constraint in `self` is present in `other` with the same
    /// value. An empty constraint set is satisfied by anything.
    pub fn is_satisfied_by(&self, other: &Properties) -> bool {
        self.0
            .iter()
            .all(|(k, v)| other.0.get(k).is_some_and(|o| o == v))
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

/// An immutable query for a desired output: target, value name and a set of
/// constraining properties.
///
/// Requirements are the unit of deduplication: equivalent requirements (same
/// identity) share one resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Requirement {
    pub target: TargetRef,
    pub value_name: Arc<str>,
    pub constraints: Properties,
}

impl Requirement {
    pub fn new(target: TargetRef, value_name: impl Into<Arc<str>>) -> Self {
        Self {
            target,
            value_name: value_name.into(),
            constraints: Properties::new(),
        }
    }

    #[must_use]
    pub fn with_constraint(
        mut self,
        key: impl Into<Arc<str>>,
        value: impl Into<Arc<str>>,
    ) -> Self {
        self.constraints = self.constraints.with(key, value);
        self
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.value_name, self.target, self.constraints)
    }
}

/// An immutable, concrete description of an output a specific function can
/// produce for a target.
///
/// Many specifications may satisfy one requirement, and one specification may
/// satisfy many requirements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Specification {
    pub target: TargetRef,
    pub value_name: Arc<str>,
    pub properties: Properties,
    pub function: FunctionId,
}

impl Specification {
    pub fn new(
        target: TargetRef,
        value_name: impl Into<Arc<str>>,
        function: FunctionId,
    ) -> Self {
        Self {
            target,
            value_name: value_name.into(),
            properties: Properties::new(),
            function,
        }
    }

    #[must_use]
    pub fn with_property(
        mut self,
        key: impl Into<Arc<str>>,
        value: impl Into<Arc<str>>,
    ) -> Self {
        self.properties = self.properties.with(key, value);
        self
    }

    /// Whether this specification satisfies the given requirement.
    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        self.target == requirement.target
            && self.value_name == requirement.value_name
            && requirement.constraints.is_satisfied_by(&self.properties)
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{} <- {}",
            self.value_name, self.target, self.properties, self.function
        )
    }
}

/// One distinct application of a producing function: the node identity of the
/// final dependency graph.
///
/// Raw/leaf inputs are invocations with no inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionInvocation {
    pub function: FunctionId,
    pub target: TargetRef,
    pub inputs: Vec<Specification>,
    pub outputs: Vec<Specification>,
}

/// A specification bound to the evidence that it was actually produced.
///
/// Immutable once created and globally cached keyed by specification; this is
/// the memoization table that lets unrelated branches reuse work.
#[derive(Debug, Clone)]
pub struct ResolvedValue {
    pub specification: Specification,
    pub invocation: Arc<FunctionInvocation>,
    /// Resolved inputs, aligned with `invocation.inputs`.
    pub inputs: Vec<Arc<ResolvedValue>>,
}

impl ResolvedValue {
    /// A trivial resolved value for a raw/leaf input: an invocation of the
    /// sourcing function named by the specification, with no inputs.
    pub fn leaf(specification: Specification) -> Self {
        let invocation = Arc::new(FunctionInvocation {
            function: specification.function.clone(),
            target: specification.target.clone(),
            inputs: Vec::new(),
            outputs: vec![specification.clone()],
        });
        Self {
            specification,
            invocation,
            inputs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(props: Properties) -> Specification {
        Specification {
            target: TargetRef::new("t1"),
            value_name: "Price".into(),
            properties: props,
            function: FunctionId::new("f1"),
        }
    }

    #[test]
    fn empty_constraints_satisfied_by_anything() {
        let req = Requirement::new(TargetRef::new("t1"), "Price");
        assert!(spec(Properties::new()).satisfies(&req));
        assert!(spec(Properties::new().with("ccy", "EUR")).satisfies(&req));
    }

    #[test]
    fn constraints_must_match_exactly() {
        let req = Requirement::new(TargetRef::new("t1"), "Price").with_constraint("ccy", "EUR");
        assert!(spec(Properties::new().with("ccy", "EUR")).satisfies(&req));
        assert!(!spec(Properties::new().with("ccy", "USD")).satisfies(&req));
        assert!(!spec(Properties::new()).satisfies(&req));
    }

    #[test]
    fn target_and_value_name_are_part_of_identity() {
        let req = Requirement::new(TargetRef::new("t2"), "Price");
        assert!(!spec(Properties::new()).satisfies(&req));
        let req = Requirement::new(TargetRef::new("t1"), "Delta");
        assert!(!spec(Properties::new()).satisfies(&req));
    }

    #[test]
    fn leaf_value_has_no_inputs() {
        let s = spec(Properties::new());
        let v = ResolvedValue::leaf(s.clone());
        assert!(v.inputs.is_empty());
        assert!(v.invocation.inputs.is_empty());
        assert_eq!(v.invocation.outputs, vec![s]);
    }
}
