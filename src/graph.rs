//! Terminal outcome accumulation and the emitted dependency graph.
//!
//! While the build runs, the [`TerminalAccumulator`] collects the outcome of
//! every top-level requirement. Once the builder quiesces, the accumulated
//! resolved values are walked along their provenance and folded into a
//! [`DependencyGraph`]: a petgraph `DiGraph` holding each distinct function
//! invocation once, with edges labelled by the specification flowing along
//! them, plus the requirement→specification terminal map.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};

use crate::model::{FunctionInvocation, Requirement, ResolvedValue, Specification};
use crate::resolver::ResolutionFailure;

/// Collects the settled outcome of each submitted requirement.
///
/// A re-published value supersedes the previous binding for its requirement,
/// so terminals converge with the rest of the graph when a producer is
/// pumped. A failure never displaces a recorded success.
#[derive(Default)]
pub(crate) struct TerminalAccumulator {
    requested: BTreeSet<Requirement>,
    resolved: BTreeMap<Requirement, Arc<ResolvedValue>>,
    failures: BTreeMap<Requirement, Arc<ResolutionFailure>>,
}

impl TerminalAccumulator {
    /// Registers interest in a top-level requirement. Returns `false` when
    /// the requirement was already submitted.
    pub(crate) fn record_requested(&mut self, requirement: Requirement) -> bool {
        self.requested.insert(requirement)
    }

    pub(crate) fn record_success(&mut self, requirement: Requirement, value: Arc<ResolvedValue>) {
        self.failures.remove(&requirement);
        self.resolved.insert(requirement, value);
    }

    pub(crate) fn record_failure(
        &mut self,
        requirement: Requirement,
        failure: Arc<ResolutionFailure>,
    ) {
        if !self.resolved.contains_key(&requirement) {
            self.failures.entry(requirement).or_insert(failure);
        }
    }

    /// Requirements submitted but not yet decided either way.
    pub(crate) fn pending(&self) -> usize {
        self.requested
            .iter()
            .filter(|requirement| {
                !self.resolved.contains_key(*requirement)
                    && !self.failures.contains_key(*requirement)
            })
            .count()
    }

    pub(crate) fn outstanding(&self) -> Vec<Requirement> {
        self.requested
            .iter()
            .filter(|requirement| {
                !self.resolved.contains_key(*requirement)
                    && !self.failures.contains_key(*requirement)
            })
            .cloned()
            .collect()
    }

    pub(crate) fn resolved(&self) -> &BTreeMap<Requirement, Arc<ResolvedValue>> {
        &self.resolved
    }

    pub(crate) fn failures(&self) -> &BTreeMap<Requirement, Arc<ResolutionFailure>> {
        &self.failures
    }

    /// Folds everything resolved so far into the final artifact.
    pub(crate) fn materialize(&self) -> DependencyGraph {
        let mut graph = DiGraph::new();
        let mut nodes: HashMap<Arc<FunctionInvocation>, NodeIndex> = HashMap::new();
        let mut terminals = BTreeMap::new();

        for (requirement, value) in &self.resolved {
            terminals.insert(requirement.clone(), value.specification.clone());
            add_provenance(&mut graph, &mut nodes, value);
        }

        DependencyGraph { graph, terminals }
    }
}

/// Walks a resolved value's provenance, adding each distinct invocation once
/// and wiring producer→consumer edges labelled with the consumed
/// specification.
fn add_provenance(
    graph: &mut DiGraph<DependencyNode, Specification>,
    nodes: &mut HashMap<Arc<FunctionInvocation>, NodeIndex>,
    value: &Arc<ResolvedValue>,
) -> NodeIndex {
    if let Some(&existing) = nodes.get(&value.invocation) {
        return existing;
    }
    let index = graph.add_node(DependencyNode {
        invocation: value.invocation.clone(),
    });
    nodes.insert(value.invocation.clone(), index);
    for input in &value.inputs {
        let producer = add_provenance(graph, nodes, input);
        graph.add_edge(producer, index, input.specification.clone());
    }
    index
}

/// One node of the final graph: a distinct function invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub invocation: Arc<FunctionInvocation>,
}

impl DependencyNode {
    /// Raw/leaf inputs have no incoming edges and no declared inputs.
    pub fn is_leaf(&self) -> bool {
        self.invocation.inputs.is_empty()
    }
}

/// The final, immutable artifact of a build.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Distinct invocations, edges labelled with the specification consumed
    /// along them.
    pub graph: DiGraph<DependencyNode, Specification>,
    /// What each originally submitted requirement was bound to.
    pub terminals: BTreeMap<Requirement, Specification>,
}

impl DependencyGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// The specification chosen for a submitted requirement, if it resolved.
    pub fn terminal(&self, requirement: &Requirement) -> Option<&Specification> {
        self.terminals.get(requirement)
    }

    pub fn invocations(&self) -> impl Iterator<Item = &Arc<FunctionInvocation>> {
        self.graph
            .node_weights()
            .map(|node| &node.invocation)
    }

    fn canonical(
        &self,
    ) -> (
        BTreeSet<Arc<FunctionInvocation>>,
        BTreeSet<(Arc<FunctionInvocation>, Arc<FunctionInvocation>, Specification)>,
    ) {
        let nodes = self
            .graph
            .node_weights()
            .map(|node| node.invocation.clone())
            .collect();
        let edges = self
            .graph
            .edge_indices()
            .filter_map(|edge| {
                let (source, target) = self.graph.edge_endpoints(edge)?;
                Some((
                    self.graph[source].invocation.clone(),
                    self.graph[target].invocation.clone(),
                    self.graph[edge].clone(),
                ))
            })
            .collect();
        (nodes, edges)
    }
}

/// Structural equality: same terminal bindings and the same node/edge sets,
/// regardless of petgraph index assignment.
impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.terminals == other.terminals && self.canonical() == other.canonical()
    }
}

impl Eq for DependencyGraph {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FunctionId, TargetRef};

    fn spec(name: &str, function: &str) -> Specification {
        Specification::new(TargetRef::new("t"), name, FunctionId::new(function))
    }

    fn req(name: &str) -> Requirement {
        Requirement::new(TargetRef::new("t"), name)
    }

    fn value_with_input(
        output: Specification,
        input: Arc<ResolvedValue>,
    ) -> Arc<ResolvedValue> {
        let invocation = Arc::new(FunctionInvocation {
            function: output.function.clone(),
            target: output.target.clone(),
            inputs: vec![input.specification.clone()],
            outputs: vec![output.clone()],
        });
        Arc::new(ResolvedValue {
            specification: output,
            invocation,
            inputs: vec![input],
        })
    }

    #[test]
    fn shared_provenance_appears_once() {
        let leaf = Arc::new(ResolvedValue::leaf(spec("Raw", "source")));
        let a = value_with_input(spec("A", "fa"), leaf.clone());
        let b = value_with_input(spec("B", "fb"), leaf);

        let mut accumulator = TerminalAccumulator::default();
        accumulator.record_requested(req("A"));
        accumulator.record_requested(req("B"));
        accumulator.record_success(req("A"), a);
        accumulator.record_success(req("B"), b);

        let graph = accumulator.materialize();
        // leaf + two consumers, with the leaf deduplicated
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.terminal(&req("A")), Some(&spec("A", "fa")));
    }

    #[test]
    fn republished_value_supersedes_the_binding() {
        let mut accumulator = TerminalAccumulator::default();
        accumulator.record_requested(req("A"));
        let first = Arc::new(ResolvedValue::leaf(spec("A", "f1")));
        let second = Arc::new(ResolvedValue::leaf(spec("A", "f2")));
        accumulator.record_success(req("A"), first);
        accumulator.record_success(req("A"), second);
        let graph = accumulator.materialize();
        assert_eq!(graph.terminal(&req("A")), Some(&spec("A", "f2")));
    }

    #[test]
    fn failure_after_success_is_ignored() {
        let mut accumulator = TerminalAccumulator::default();
        accumulator.record_requested(req("A"));
        accumulator.record_success(req("A"), Arc::new(ResolvedValue::leaf(spec("A", "f"))));
        accumulator.record_failure(
            req("A"),
            Arc::new(ResolutionFailure {
                requirement: req("A"),
                attempts: Vec::new(),
                ancestors: Vec::new(),
            }),
        );
        assert_eq!(accumulator.pending(), 0);
        assert!(accumulator.failures().is_empty());
    }

    #[test]
    fn structural_equality_ignores_insertion_order() {
        let leaf = Arc::new(ResolvedValue::leaf(spec("Raw", "source")));
        let a = value_with_input(spec("A", "fa"), leaf.clone());
        let b = value_with_input(spec("B", "fb"), leaf);

        let mut forward = TerminalAccumulator::default();
        forward.record_success(req("A"), a.clone());
        forward.record_success(req("B"), b.clone());

        let mut backward = TerminalAccumulator::default();
        backward.record_success(req("B"), b);
        backward.record_success(req("A"), a);

        assert_eq!(forward.materialize(), backward.materialize());
    }

    #[test]
    fn pending_counts_undecided_requests() {
        let mut accumulator = TerminalAccumulator::default();
        accumulator.record_requested(req("A"));
        accumulator.record_requested(req("B"));
        assert_eq!(accumulator.pending(), 2);
        accumulator.record_success(req("A"), Arc::new(ResolvedValue::leaf(spec("A", "f"))));
        assert_eq!(accumulator.pending(), 1);
        assert_eq!(accumulator.outstanding(), vec![req("B")]);
    }
}
