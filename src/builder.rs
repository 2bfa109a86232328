//! The public build surface and the shared engine state behind it.
//!
//! A [`GraphBuilder`] is a cheap clonable handle over the shared state:
//! queues, caches, the task arena, the terminal accumulator and the coarse
//! build state (active jobs, worker cap, cancellation, cached graph). Work is
//! submitted non-blockingly; bounded worker jobs resolve it in the
//! background, and any caller may block in [`GraphBuilder::materialize`] to
//! join in as a worker and collect the final graph.
//!
//! "Built" means: no active jobs and both queues empty, observed under the
//! same lock submissions take. At that point stuck dependency cycles are
//! aborted, the freed work is drained, and the accumulated terminals are
//! folded into the immutable [`DependencyGraph`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::ResolutionCache;
use crate::context::GraphBuildingContext;
use crate::error::BuildError;
use crate::graph::{DependencyGraph, TerminalAccumulator};
use crate::model::{Requirement, Specification};
use crate::queue::WorkQueue;
use crate::resolver::{
    AvailabilityCheck, CountingSink, DiagnosticSink, FunctionResolver, NoRawInputs,
    RejectionReason,
};
use crate::task::{
    AncestorPath, Arena, Callback, Outcome, TaskId, force_exhaust, register_or_outcome,
    release_refs, resolve_child,
};
use crate::worker::{JobExecutor, RayonExecutor, job_loop, run_unit};

/// Coarse mutable build state, guarded by one lock shared between
/// submission, worker accounting and termination observation.
pub(crate) struct BuildState {
    pub(crate) active_jobs: usize,
    pub(crate) worker_cap: usize,
    pub(crate) cancelled: bool,
    graph: Option<Arc<DependencyGraph>>,
}

pub(crate) struct Shared {
    pub(crate) resolver: Arc<dyn FunctionResolver>,
    pub(crate) availability: Arc<dyn AvailabilityCheck>,
    pub(crate) sink: Arc<dyn DiagnosticSink>,
    pub(crate) executor: Arc<dyn JobExecutor>,
    pub(crate) run_queue: WorkQueue,
    pub(crate) deferred: WorkQueue,
    pub(crate) cache: ResolutionCache,
    pub(crate) arena: Arena,
    pub(crate) terminals: Mutex<TerminalAccumulator>,
    pub(crate) faults: DashMap<String, u64>,
    pub(crate) steps: AtomicU64,
    pub(crate) state: Mutex<BuildState>,
    self_ref: Weak<Shared>,
}

impl Shared {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Spawns worker jobs up to the cap, one per queued unit.
    pub(crate) fn maybe_spawn(&self) {
        let Some(shared) = self.self_ref.upgrade() else {
            return;
        };
        let want = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            let want = self
                .run_queue
                .len()
                .min(state.worker_cap.saturating_sub(state.active_jobs));
            state.active_jobs += want;
            want
        };
        for _ in 0..want {
            let shared = shared.clone();
            self.executor.spawn_job(Box::new(move || job_loop(shared)));
        }
    }

    /// Worker exit protocol: deregister under the state lock, re-checking the
    /// run queue once so a submission racing with the exit is not stranded.
    /// The last worker standing also restarts one deferred unit rather than
    /// leaving contended work without anyone to retry it.
    pub(crate) fn try_exit_worker(&self) -> bool {
        let mut state = self.state.lock();
        if !self.run_queue.is_empty() {
            return false;
        }
        if !self.deferred.is_empty() && state.active_jobs == 1 {
            if let Some(parked) = self.deferred.take_next() {
                self.run_queue.push(parked);
            }
            return false;
        }
        state.active_jobs = state.active_jobs.saturating_sub(1);
        true
    }

    pub(crate) fn deregister_worker(&self) {
        let mut state = self.state.lock();
        state.active_jobs = state.active_jobs.saturating_sub(1);
    }
}

/// Evicts finished tasks nothing references any more: their requirement
/// bucket becomes a tombstone and the references they hold on their own
/// input producers are dropped, so unreferenced chains unravel over
/// successive passes. Returns the number of evicted tasks.
pub(crate) fn housekeep(shared: &Shared) -> usize {
    let mut evicted = 0;
    for id in shared.arena.ids() {
        let Some(handle) = shared.arena.get(id) else {
            continue;
        };
        let released = {
            let mut task = handle.lock();
            if !(task.state.is_finished() && task.refs == 0 && task.callbacks.is_empty()) {
                continue;
            }
            shared.cache.evict_task(&task.requirement, id);
            shared.arena.remove(id);
            task.clear_slots(true, true)
        };
        release_refs(shared, released);
        evicted += 1;
    }
    shared.cache.retain_producers(|task| shared.arena.contains(task));
    if evicted > 0 {
        debug!(
            "housekeeping evicted {evicted} tasks, {} values memoized",
            shared.cache.resolutions()
        );
    }
    evicted
}

/// Tasks sitting on a wait-for cycle, computed over a snapshot of producer
/// edges among waiting tasks.
fn find_cycle_members(edges: &HashMap<TaskId, Vec<TaskId>>) -> BTreeSet<TaskId> {
    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;

    let mut colors: HashMap<TaskId, u8> = HashMap::new();
    let mut members = BTreeSet::new();

    for &start in edges.keys() {
        if colors.get(&start).copied().unwrap_or(WHITE) != WHITE {
            continue;
        }
        let mut stack: Vec<(TaskId, usize)> = vec![(start, 0)];
        colors.insert(start, GRAY);

        while let Some(top) = stack.len().checked_sub(1) {
            let (node, index) = stack[top];
            let children = &edges[&node];
            if index < children.len() {
                stack[top].1 += 1;
                let child = children[index];
                if !edges.contains_key(&child) {
                    continue;
                }
                match colors.get(&child).copied().unwrap_or(WHITE) {
                    WHITE => {
                        colors.insert(child, GRAY);
                        stack.push((child, 0));
                    }
                    GRAY => {
                        if let Some(position) =
                            stack.iter().position(|(member, _)| *member == child)
                        {
                            for (member, _) in &stack[position..] {
                                members.insert(*member);
                            }
                        }
                    }
                    _ => {}
                }
            } else {
                colors.insert(node, BLACK);
                stack.pop();
            }
        }
    }
    members
}

/// One loop-abort pass over the arena. Returns whether anything was failed.
fn abort_loops(shared: &Shared, ctx: &mut GraphBuildingContext) -> bool {
    let mut edges: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for id in shared.arena.ids() {
        let Some(handle) = shared.arena.get(id) else {
            continue;
        };
        let task = handle.lock();
        if !task.state.is_waiting() {
            continue;
        }
        let waits = task
            .inputs
            .iter()
            .chain(task.additional.iter())
            .filter(|slot| slot.value.is_none())
            .filter_map(|slot| slot.producer)
            .collect();
        edges.insert(id, waits);
    }
    if edges.is_empty() {
        return false;
    }

    let on_cycle = find_cycle_members(&edges);
    if on_cycle.is_empty() {
        // Queues are empty yet tasks still wait and no cycle explains it.
        // Fail them all rather than hang a blocked caller.
        warn!("{} tasks stuck without a wait-for cycle; failing all", edges.len());
        for id in edges.keys() {
            force_exhaust(shared, ctx, *id, RejectionReason::DependencyCycle);
        }
        return true;
    }

    info!("aborting {} tasks on dependency cycles", on_cycle.len());
    for id in on_cycle {
        force_exhaust(shared, ctx, id, RejectionReason::DependencyCycle);
    }
    true
}

/// Runs queued work inline on the calling thread until both queues drain or
/// only contended units remain.
fn drain_inline(shared: &Shared) {
    let mut contended_round = 0usize;
    loop {
        if let Some(id) = shared.run_queue.take_next() {
            run_unit(shared, id);
            contended_round = 0;
            continue;
        }
        if let Some(id) = shared.deferred.take_next() {
            if run_unit(shared, id) == crate::task::UnitOutcome::Deferred {
                contended_round += 1;
                if contended_round > shared.deferred.len() {
                    // Everything left is gated; let the caller poll again.
                    return;
                }
            } else {
                contended_round = 0;
            }
            continue;
        }
        return;
    }
}

/// Quiescent-time finalization: abort wait-for cycles, drain the work their
/// failure releases, and repeat to fixed point. Returns whether the builder
/// is fully settled.
fn finalize(shared: &Shared) -> bool {
    loop {
        drain_inline(shared);
        if !shared.run_queue.is_empty() || !shared.deferred.is_empty() {
            return false;
        }
        let mut ctx = GraphBuildingContext::new();
        let aborted = abort_loops(shared, &mut ctx);
        ctx.merge_into(shared);
        if !aborted {
            break;
        }
    }
    shared.run_queue.is_empty() && shared.deferred.is_empty()
}

/// Configuration for a [`GraphBuilder`], in the builder style: start from
/// [`BuilderConfig::new`], override what you need, then [`finish`].
///
/// [`finish`]: BuilderConfig::finish
pub struct BuilderConfig {
    resolver: Arc<dyn FunctionResolver>,
    availability: Arc<dyn AvailabilityCheck>,
    sink: Arc<dyn DiagnosticSink>,
    executor: Arc<dyn JobExecutor>,
    worker_cap: usize,
}

impl BuilderConfig {
    pub fn new(resolver: Arc<dyn FunctionResolver>) -> Self {
        Self {
            resolver,
            availability: Arc::new(NoRawInputs),
            sink: Arc::new(CountingSink::default()),
            executor: Arc::new(RayonExecutor),
            worker_cap: rayon::current_num_threads(),
        }
    }

    /// Raw/leaf input detection. Defaults to "nothing is raw".
    pub fn availability(mut self, availability: Arc<dyn AvailabilityCheck>) -> Self {
        self.availability = availability;
        self
    }

    /// Where resolution failures of top-level requirements go. Defaults to a
    /// counter.
    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Where worker jobs run. Defaults to the global rayon pool.
    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Maximum number of concurrent background worker jobs. Zero means all
    /// work happens on threads that block in [`GraphBuilder::materialize`]
    /// or [`GraphBuilder::wait_idle`].
    pub fn worker_cap(mut self, cap: usize) -> Self {
        self.worker_cap = cap;
        self
    }

    pub fn finish(self) -> GraphBuilder {
        let shared = Arc::new_cyclic(|self_ref| Shared {
            resolver: self.resolver,
            availability: self.availability,
            sink: self.sink,
            executor: self.executor,
            run_queue: WorkQueue::default(),
            deferred: WorkQueue::default(),
            cache: ResolutionCache::default(),
            arena: Arena::default(),
            terminals: Mutex::new(TerminalAccumulator::default()),
            faults: DashMap::new(),
            steps: AtomicU64::new(0),
            state: Mutex::new(BuildState {
                active_jobs: 0,
                worker_cap: self.worker_cap,
                cancelled: false,
                graph: None,
            }),
            self_ref: self_ref.clone(),
        });
        GraphBuilder { shared }
    }
}

/// Concurrent dependency-graph builder. Clones share one build.
#[derive(Clone)]
pub struct GraphBuilder {
    shared: Arc<Shared>,
}

impl GraphBuilder {
    /// Submits one top-level requirement. Non-blocking; resolution happens on
    /// worker jobs (or on whoever blocks in [`materialize`]).
    ///
    /// [`materialize`]: GraphBuilder::materialize
    pub fn submit(&self, requirement: Requirement) {
        self.submit_all([requirement]);
    }

    /// Submits a batch of requirements atomically with respect to
    /// termination observation: no caller can see the build "done" with only
    /// part of the batch accepted. Submitting after a graph was built
    /// invalidates the cached graph.
    pub fn submit_all(&self, requirements: impl IntoIterator<Item = Requirement>) {
        let shared = &self.shared;
        let mut failed_now = Vec::new();
        {
            let mut state = shared.state.lock();
            if state.cancelled {
                return;
            }
            state.graph = None;

            for requirement in requirements {
                debug!("submitted {requirement}");
                // An already tracked requirement keeps its original terminal
                // callback; registering another would double-notify the sink.
                if !shared
                    .terminals
                    .lock()
                    .record_requested(requirement.clone())
                {
                    continue;
                }

                let (id, handle, created) =
                    resolve_child(shared, &requirement, &AncestorPath::root());
                let callback = Callback::Terminal {
                    requirement: requirement.clone(),
                };
                match register_or_outcome(&handle, callback, false) {
                    // Already settled; answer from the cache.
                    Some(Outcome::Value(value)) => {
                        shared.terminals.lock().record_success(requirement, value);
                    }
                    Some(Outcome::Failed(failure)) => {
                        shared
                            .terminals
                            .lock()
                            .record_failure(requirement, failure.clone());
                        failed_now.push(failure);
                    }
                    None => {
                        if created {
                            let mut task = handle.lock();
                            if !task.enqueued {
                                task.enqueued = true;
                                drop(task);
                                shared.run_queue.push(id);
                            }
                        }
                    }
                }
            }
        }
        for failure in failed_now {
            shared.sink.resolution_failed(&failure);
        }
        shared.maybe_spawn();
    }

    /// Returns the finished graph if the build has quiesced, finalizing it
    /// (cycle abort and all) on first observation. Never blocks on pending
    /// work; returns `None` while anything is still running or queued.
    pub fn poll_graph(&self) -> Option<Arc<DependencyGraph>> {
        let shared = &self.shared;
        {
            let state = shared.state.lock();
            if state.cancelled {
                return None;
            }
            if let Some(graph) = &state.graph {
                return Some(graph.clone());
            }
            if state.active_jobs > 0
                || !shared.run_queue.is_empty()
                || !shared.deferred.is_empty()
            {
                return None;
            }
        }

        if !finalize(shared) {
            return None;
        }

        let (graph, pending) = {
            let terminals = shared.terminals.lock();
            (Arc::new(terminals.materialize()), terminals.pending())
        };
        if pending > 0 {
            warn!("{pending} requirements still undecided at finalization");
        }
        let mut state = shared.state.lock();
        if state.active_jobs == 0
            && shared.run_queue.is_empty()
            && shared.deferred.is_empty()
            && state.graph.is_none()
            && !state.cancelled
        {
            info!(
                "dependency graph built: {} nodes, {} edges, {} terminals",
                graph.node_count(),
                graph.edge_count(),
                graph.terminals.len()
            );
            state.graph = Some(graph.clone());
            Some(graph)
        } else {
            // Raced with a submission or another finalizer.
            state.graph.clone()
        }
    }

    /// Blocks until the graph is built and returns it, joining in as a
    /// worker for as long as runnable work exists.
    pub fn materialize(&self) -> Result<Arc<DependencyGraph>, BuildError> {
        let shared = &self.shared;
        loop {
            if shared.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            if let Some(id) = shared.run_queue.take_next() {
                run_unit(shared, id);
                continue;
            }
            if let Some(graph) = self.poll_graph() {
                return Ok(graph);
            }
            if shared.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            if let Some(id) = shared.deferred.take_next() {
                if run_unit(shared, id) == crate::task::UnitOutcome::Deferred {
                    std::thread::sleep(Duration::from_millis(1));
                }
                continue;
            }
            // Background jobs still winding down.
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Blocks until no work is queued or running, without finalizing a
    /// graph. Joins in as a worker like [`materialize`].
    ///
    /// [`materialize`]: GraphBuilder::materialize
    pub fn wait_idle(&self) -> Result<(), BuildError> {
        let shared = &self.shared;
        loop {
            if shared.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            if let Some(id) = shared.run_queue.take_next() {
                run_unit(shared, id);
                continue;
            }
            {
                let state = shared.state.lock();
                if state.active_jobs == 0
                    && shared.run_queue.is_empty()
                    && shared.deferred.is_empty()
                {
                    return Ok(());
                }
            }
            if let Some(id) = shared.deferred.take_next() {
                if run_unit(shared, id) == crate::task::UnitOutcome::Deferred {
                    std::thread::sleep(Duration::from_millis(1));
                }
                continue;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Requests cancellation. Returns `true` if this call was the one that
    /// cancelled the build; repeated calls return `false`. Workers stop at
    /// their next unit boundary and blocked callers get
    /// [`BuildError::Cancelled`].
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            return false;
        }
        warn!("build cancelled");
        state.cancelled = true;
        state.worker_cap = 0;
        true
    }

    pub fn worker_cap(&self) -> usize {
        self.shared.state.lock().worker_cap
    }

    /// Adjusts the background worker cap. Raising it from zero resumes
    /// background building immediately if work is queued.
    pub fn set_worker_cap(&self, cap: usize) {
        {
            let mut state = self.shared.state.lock();
            if state.cancelled {
                return;
            }
            state.worker_cap = cap;
        }
        self.shared.maybe_spawn();
    }

    /// Top-level requirements not yet decided either way.
    pub fn outstanding(&self) -> Vec<Requirement> {
        self.shared.terminals.lock().outstanding()
    }

    /// The requirement→specification bindings resolved so far.
    pub fn resolutions(&self) -> BTreeMap<Requirement, Specification> {
        self.shared
            .terminals
            .lock()
            .resolved()
            .iter()
            .map(|(requirement, value)| (requirement.clone(), value.specification.clone()))
            .collect()
    }

    /// Resolution failures of top-level requirements recorded so far.
    pub fn failures(&self) -> BTreeMap<Requirement, Arc<crate::resolver::ResolutionFailure>> {
        self.shared.terminals.lock().failures().clone()
    }

    /// Number of tasks currently held in the arena. Drops as housekeeping
    /// evicts finished, unreferenced tasks.
    pub fn live_tasks(&self) -> usize {
        self.shared.arena.len()
    }

    /// Captured infrastructure faults, keyed by root cause, with counts.
    pub fn fault_tally(&self) -> BTreeMap<String, u64> {
        self.shared
            .faults
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Runs one cache eviction pass. Workers do this periodically on their
    /// own; exposed for owners that want deterministic cleanup points.
    pub fn housekeep(&self) -> usize {
        housekeep(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::model::{FunctionId, ResolvedValue, TargetRef};
    use crate::resolver::{CandidateFunction, ResolutionFailure, Validation};

    type Validator = Box<
        dyn Fn(&Requirement, &[Arc<ResolvedValue>], &[Arc<ResolvedValue>]) -> Validation
            + Send
            + Sync,
    >;

    struct TestFunction {
        id: FunctionId,
        group: Option<String>,
        inputs: Vec<Requirement>,
        validator: Validator,
        validations: AtomicU64,
        gate: Option<Arc<AtomicBool>>,
    }

    impl TestFunction {
        fn new(id: &str, inputs: Vec<Requirement>, validator: Validator) -> Self {
            Self {
                id: FunctionId::new(id),
                group: None,
                inputs,
                validator,
                validations: AtomicU64::new(0),
                gate: None,
            }
        }

        fn accepting(id: &str, inputs: Vec<Requirement>, output: Specification) -> Self {
            Self::new(
                id,
                inputs,
                Box::new(move |_, _, _| Validation::Accept(output.clone())),
            )
        }

        fn grouped(mut self, group: &str) -> Self {
            self.group = Some(group.to_string());
            self
        }

        fn gated(mut self, gate: Arc<AtomicBool>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    impl CandidateFunction for TestFunction {
        fn id(&self) -> FunctionId {
            self.id.clone()
        }

        fn exclusion_group(&self) -> Option<&str> {
            self.group.as_deref()
        }

        fn inputs(&self, _requirement: &Requirement) -> anyhow::Result<Vec<Requirement>> {
            Ok(self.inputs.clone())
        }

        fn validate(
            &self,
            requirement: &Requirement,
            inputs: &[Arc<ResolvedValue>],
            additional: &[Arc<ResolvedValue>],
        ) -> anyhow::Result<Validation> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            Ok((self.validator)(requirement, inputs, additional))
        }

        fn try_acquire(&self) -> bool {
            match &self.gate {
                Some(gate) => gate
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok(),
                None => true,
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.store(false, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct Catalogue {
        entries: HashMap<(String, String), Vec<Arc<TestFunction>>>,
    }

    impl Catalogue {
        fn add(&mut self, target: &str, value: &str, function: TestFunction) -> Arc<TestFunction> {
            let function = Arc::new(function);
            self.entries
                .entry((target.to_string(), value.to_string()))
                .or_default()
                .push(function.clone());
            function
        }
    }

    impl FunctionResolver for Catalogue {
        fn candidates(
            &self,
            requirement: &Requirement,
        ) -> anyhow::Result<Vec<Arc<dyn CandidateFunction>>> {
            let key = (
                requirement.target.as_str().to_string(),
                requirement.value_name.to_string(),
            );
            Ok(self
                .entries
                .get(&key)
                .map(|functions| {
                    functions
                        .iter()
                        .map(|function| function.clone() as Arc<dyn CandidateFunction>)
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RawInputs {
        specs: HashMap<(String, String), Specification>,
    }

    impl RawInputs {
        fn add(&mut self, specification: Specification) {
            self.specs.insert(
                (
                    specification.target.as_str().to_string(),
                    specification.value_name.to_string(),
                ),
                specification,
            );
        }
    }

    impl AvailabilityCheck for RawInputs {
        fn available(&self, requirement: &Requirement) -> Option<Specification> {
            let key = (
                requirement.target.as_str().to_string(),
                requirement.value_name.to_string(),
            );
            self.specs
                .get(&key)
                .filter(|specification| specification.satisfies(requirement))
                .cloned()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        failures: Mutex<Vec<ResolutionFailure>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn resolution_failed(&self, failure: &ResolutionFailure) {
            self.failures.lock().push(failure.clone());
        }
    }

    fn req(target: &str, value: &str) -> Requirement {
        Requirement::new(TargetRef::new(target), value)
    }

    fn spec(target: &str, value: &str, function: &str) -> Specification {
        Specification::new(TargetRef::new(target), value, FunctionId::new(function))
    }

    fn builder_with(catalogue: Catalogue, raw: RawInputs, cap: usize) -> GraphBuilder {
        BuilderConfig::new(Arc::new(catalogue))
            .availability(Arc::new(raw))
            .worker_cap(cap)
            .finish()
    }

    /// Pv(t1) <- f_pv(Curve, Spot); Curve <- f_curve(Quotes);
    /// Delta(t1) <- f_delta(Curve); Quotes and Spot are raw.
    fn pricing_setup() -> (Catalogue, RawInputs) {
        let mut catalogue = Catalogue::default();
        let mut raw = RawInputs::default();
        raw.add(spec("t1", "Quotes", "source"));
        raw.add(spec("t1", "Spot", "source"));
        catalogue.add(
            "t1",
            "Curve",
            TestFunction::accepting("f_curve", vec![req("t1", "Quotes")], spec("t1", "Curve", "f_curve")),
        );
        catalogue.add(
            "t1",
            "Pv",
            TestFunction::accepting(
                "f_pv",
                vec![req("t1", "Curve"), req("t1", "Spot")],
                spec("t1", "Pv", "f_pv"),
            ),
        );
        catalogue.add(
            "t1",
            "Delta",
            TestFunction::accepting("f_delta", vec![req("t1", "Curve")], spec("t1", "Delta", "f_delta")),
        );
        (catalogue, raw)
    }

    #[test]
    fn chain_resolves_into_expected_graph() {
        let (catalogue, raw) = pricing_setup();
        let builder = builder_with(catalogue, raw, 0);
        builder.submit(req("t1", "Pv"));
        let graph = builder.materialize().unwrap();
        assert_eq!(graph.terminal(&req("t1", "Pv")), Some(&spec("t1", "Pv", "f_pv")));
        // two raw leaves, the curve and the pv invocation
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn empty_build_materializes_an_empty_graph() {
        let (catalogue, raw) = pricing_setup();
        let builder = builder_with(catalogue, raw, 0);
        let graph = builder.materialize().unwrap();
        assert_eq!(graph.node_count(), 0);
        assert!(graph.terminals.is_empty());
    }

    #[test]
    fn same_graph_for_any_worker_cap() {
        let mut graphs = Vec::new();
        for cap in [0, 1, 4] {
            let (catalogue, raw) = pricing_setup();
            let builder = builder_with(catalogue, raw, cap);
            builder.submit_all([req("t1", "Pv"), req("t1", "Delta")]);
            graphs.push(builder.materialize().unwrap());
        }
        assert_eq!(*graphs[0], *graphs[1]);
        assert_eq!(*graphs[0], *graphs[2]);
    }

    #[test]
    fn equivalent_requirements_share_one_resolution() {
        let (mut catalogue, raw) = (Catalogue::default(), {
            let mut raw = RawInputs::default();
            raw.add(spec("t1", "Quotes", "source"));
            raw
        });
        let f_curve = catalogue.add(
            "t1",
            "Curve",
            TestFunction::accepting("f_curve", vec![req("t1", "Quotes")], spec("t1", "Curve", "f_curve")),
        );
        catalogue.add(
            "t1",
            "Pv",
            TestFunction::accepting("f_pv", vec![req("t1", "Curve")], spec("t1", "Pv", "f_pv")),
        );
        catalogue.add(
            "t1",
            "Delta",
            TestFunction::accepting("f_delta", vec![req("t1", "Curve")], spec("t1", "Delta", "f_delta")),
        );

        let builder = builder_with(catalogue, raw, 4);
        builder.submit_all([req("t1", "Pv"), req("t1", "Delta")]);
        let graph = builder.materialize().unwrap();

        assert_eq!(f_curve.validations.load(Ordering::SeqCst), 1);
        let curve_nodes = graph
            .invocations()
            .filter(|invocation| invocation.function == FunctionId::new("f_curve"))
            .count();
        assert_eq!(curve_nodes, 1);
    }

    #[test]
    fn validation_rejection_backtracks_to_alternative_producer() {
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t",
            "Mid",
            TestFunction::accepting(
                "foo_maker",
                vec![],
                spec("t", "Mid", "foo_maker").with_property("kind", "foo"),
            ),
        );
        catalogue.add(
            "t",
            "Mid",
            TestFunction::accepting(
                "bar_maker",
                vec![],
                spec("t", "Mid", "bar_maker").with_property("kind", "bar"),
            ),
        );
        catalogue.add(
            "t",
            "Out",
            TestFunction::new(
                "conv",
                vec![req("t", "Mid")],
                Box::new(|_, inputs, _| {
                    if inputs[0].specification.properties.get("kind") == Some("bar") {
                        Validation::Accept(spec("t", "Out", "conv"))
                    } else {
                        Validation::Reject("cannot convert from foo".into())
                    }
                }),
            ),
        );

        let builder = builder_with(catalogue, RawInputs::default(), 0);
        builder.submit(req("t", "Out"));
        let graph = builder.materialize().unwrap();

        assert!(graph
            .invocations()
            .any(|invocation| invocation.function == FunctionId::new("bar_maker")));
        assert!(!graph
            .invocations()
            .any(|invocation| invocation.function == FunctionId::new("foo_maker")));
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn pumped_republish_rebinds_every_consumer() {
        // Quick accepts whichever Mid came first; Pv insists on bar and pumps
        // the shared producer. Both must end up bound to the alternative, at
        // any worker cap.
        fn shared_producer_setup() -> Catalogue {
            let mut catalogue = Catalogue::default();
            catalogue.add(
                "t",
                "Mid",
                TestFunction::accepting(
                    "foo_maker",
                    vec![],
                    spec("t", "Mid", "foo_maker").with_property("kind", "foo"),
                ),
            );
            catalogue.add(
                "t",
                "Mid",
                TestFunction::accepting(
                    "bar_maker",
                    vec![],
                    spec("t", "Mid", "bar_maker").with_property("kind", "bar"),
                ),
            );
            catalogue.add(
                "t",
                "Quick",
                TestFunction::new(
                    "quick",
                    vec![req("t", "Mid")],
                    Box::new(|_, inputs, _| {
                        let kind = inputs[0]
                            .specification
                            .properties
                            .get("kind")
                            .unwrap_or("none");
                        Validation::Accept(
                            spec("t", "Quick", "quick").with_property("kind", kind),
                        )
                    }),
                ),
            );
            catalogue.add(
                "t",
                "Pv",
                TestFunction::new(
                    "conv",
                    vec![req("t", "Mid")],
                    Box::new(|_, inputs, _| {
                        if inputs[0].specification.properties.get("kind") == Some("bar") {
                            Validation::Accept(spec("t", "Pv", "conv"))
                        } else {
                            Validation::Reject("needs bar".into())
                        }
                    }),
                ),
            );
            catalogue
        }

        for cap in [0, 4] {
            let builder = builder_with(shared_producer_setup(), RawInputs::default(), cap);
            builder.submit_all([req("t", "Quick"), req("t", "Pv")]);
            let graph = builder.materialize().unwrap();

            assert!(!graph
                .invocations()
                .any(|invocation| invocation.function == FunctionId::new("foo_maker")));
            let quick = graph
                .invocations()
                .find(|invocation| invocation.function == FunctionId::new("quick"))
                .unwrap();
            assert_eq!(
                quick.inputs,
                vec![spec("t", "Mid", "bar_maker").with_property("kind", "bar")]
            );
            assert_eq!(graph.node_count(), 3);
            assert_eq!(graph.edge_count(), 2);
        }
    }

    #[test]
    fn demanded_additional_inputs_are_bound() {
        let mut catalogue = Catalogue::default();
        let mut raw = RawInputs::default();
        raw.add(spec("t", "Leg", "source"));
        raw.add(spec("t", "Fixing", "source"));
        catalogue.add(
            "t",
            "Pv",
            TestFunction::new(
                "swap",
                vec![req("t", "Leg")],
                Box::new(|_, _, additional| {
                    if additional.is_empty() {
                        Validation::Demand(vec![req("t", "Fixing")])
                    } else {
                        Validation::Accept(spec("t", "Pv", "swap"))
                    }
                }),
            ),
        );

        let builder = builder_with(catalogue, raw, 0);
        builder.submit(req("t", "Pv"));
        let graph = builder.materialize().unwrap();

        let swap = graph
            .invocations()
            .find(|invocation| invocation.function == FunctionId::new("swap"))
            .unwrap();
        assert_eq!(swap.inputs.len(), 2);
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn unresolvable_demand_falls_back_to_next_candidate() {
        let mut catalogue = Catalogue::default();
        let mut raw = RawInputs::default();
        raw.add(spec("t", "Leg", "source"));
        // Fixing is neither raw nor produced by anything.
        catalogue.add(
            "t",
            "Pv",
            TestFunction::new(
                "exact",
                vec![req("t", "Leg")],
                Box::new(|_, _, _| Validation::Demand(vec![req("t", "Fixing")])),
            ),
        );
        catalogue.add(
            "t",
            "Pv",
            TestFunction::accepting("approximate", vec![req("t", "Leg")], spec("t", "Pv", "approximate")),
        );

        let sink = Arc::new(RecordingSink::default());
        let builder = BuilderConfig::new(Arc::new(catalogue))
            .availability(Arc::new(raw))
            .diagnostics(sink.clone())
            .worker_cap(0)
            .finish();
        builder.submit(req("t", "Pv"));
        let graph = builder.materialize().unwrap();

        assert_eq!(graph.terminal(&req("t", "Pv")), Some(&spec("t", "Pv", "approximate")));
        assert!(sink.failures.lock().is_empty());
    }

    #[test]
    fn unsatisfiable_demand_pumps_input_to_alternative() {
        let mut catalogue = Catalogue::default();
        let mut raw = RawInputs::default();
        // Only the bar variant's fixing exists.
        raw.add(spec("t", "BarFixing", "source"));
        catalogue.add(
            "t",
            "Mid",
            TestFunction::accepting(
                "foo_maker",
                vec![],
                spec("t", "Mid", "foo_maker").with_property("kind", "foo"),
            ),
        );
        catalogue.add(
            "t",
            "Mid",
            TestFunction::accepting(
                "bar_maker",
                vec![],
                spec("t", "Mid", "bar_maker").with_property("kind", "bar"),
            ),
        );
        // The demanded fixing depends on the input variant, so the candidate
        // is only satisfiable after its input is pumped to bar.
        catalogue.add(
            "t",
            "Pv",
            TestFunction::new(
                "swap",
                vec![req("t", "Mid")],
                Box::new(|_, inputs, additional| {
                    if !additional.is_empty() {
                        return Validation::Accept(spec("t", "Pv", "swap"));
                    }
                    if inputs[0].specification.properties.get("kind") == Some("bar") {
                        Validation::Demand(vec![req("t", "BarFixing")])
                    } else {
                        Validation::Demand(vec![req("t", "FooFixing")])
                    }
                }),
            ),
        );

        let sink = Arc::new(RecordingSink::default());
        let builder = BuilderConfig::new(Arc::new(catalogue))
            .availability(Arc::new(raw))
            .diagnostics(sink.clone())
            .worker_cap(0)
            .finish();
        builder.submit(req("t", "Pv"));
        let graph = builder.materialize().unwrap();

        assert_eq!(graph.terminal(&req("t", "Pv")), Some(&spec("t", "Pv", "swap")));
        let swap = graph
            .invocations()
            .find(|invocation| invocation.function == FunctionId::new("swap"))
            .unwrap();
        assert_eq!(swap.inputs.len(), 2);
        assert!(swap
            .inputs
            .contains(&spec("t", "Mid", "bar_maker").with_property("kind", "bar")));
        assert!(!graph
            .invocations()
            .any(|invocation| invocation.function == FunctionId::new("foo_maker")));
        assert!(sink.failures.lock().is_empty());
    }

    #[test]
    fn self_recursive_candidate_is_rejected() {
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t",
            "A",
            TestFunction::accepting("loopy", vec![req("t", "A")], spec("t", "A", "loopy")),
        );
        catalogue.add("t", "A", TestFunction::accepting("base", vec![], spec("t", "A", "base")));

        let builder = builder_with(catalogue, RawInputs::default(), 0);
        builder.submit(req("t", "A"));
        let graph = builder.materialize().unwrap();
        assert_eq!(graph.terminal(&req("t", "A")), Some(&spec("t", "A", "base")));
    }

    #[test]
    fn reciprocal_requirements_abort_at_quiescence() {
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t",
            "A",
            TestFunction::accepting("fa", vec![req("t", "B")], spec("t", "A", "fa")),
        );
        catalogue.add(
            "t",
            "B",
            TestFunction::accepting("fb", vec![req("t", "A")], spec("t", "B", "fb")),
        );

        let sink = Arc::new(RecordingSink::default());
        let builder = BuilderConfig::new(Arc::new(catalogue))
            .diagnostics(sink.clone())
            .worker_cap(0)
            .finish();
        builder.submit_all([req("t", "A"), req("t", "B")]);
        let graph = builder.materialize().unwrap();

        assert_eq!(graph.node_count(), 0);
        assert!(graph.terminals.is_empty());
        assert_eq!(builder.failures().len(), 2);
        let failures = sink.failures.lock();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().any(|failure| {
            failure
                .attempts
                .iter()
                .any(|attempt| matches!(attempt.reason, RejectionReason::DependencyCycle))
        }));
    }

    #[test]
    fn cancellation_releases_a_blocked_caller() {
        // The gate is held by someone else forever, so the build never finishes.
        let gate = Arc::new(AtomicBool::new(true));
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t",
            "A",
            TestFunction::accepting("blocked", vec![], spec("t", "A", "blocked")).gated(gate),
        );

        let builder = builder_with(catalogue, RawInputs::default(), 0);
        builder.submit(req("t", "A"));

        let blocked = {
            let builder = builder.clone();
            std::thread::spawn(move || builder.materialize())
        };
        std::thread::sleep(Duration::from_millis(50));

        assert!(builder.cancel());
        assert!(!builder.cancel());
        match blocked.join().unwrap() {
            Err(BuildError::Cancelled) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn materialization_is_idempotent() {
        let (catalogue, raw) = pricing_setup();
        let builder = builder_with(catalogue, raw, 0);
        builder.submit(req("t1", "Pv"));

        let first = builder.materialize().unwrap();
        let steps = builder.shared.steps.load(Ordering::SeqCst);

        let second = builder.materialize().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builder.shared.steps.load(Ordering::SeqCst), steps);

        // Resubmitting an already tracked requirement is a no-op beyond
        // invalidating the cached graph.
        builder.submit(req("t1", "Pv"));
        let third = builder.materialize().unwrap();
        assert_eq!(*first, *third);
        assert_eq!(builder.shared.steps.load(Ordering::SeqCst), steps);
    }

    #[test]
    fn resubmission_does_not_duplicate_diagnostics() {
        // Nothing can produce A, so it fails exactly once no matter how many
        // times it is submitted before the build settles.
        let sink = Arc::new(RecordingSink::default());
        let builder = BuilderConfig::new(Arc::new(Catalogue::default()))
            .diagnostics(sink.clone())
            .worker_cap(0)
            .finish();
        builder.submit(req("t", "A"));
        builder.submit(req("t", "A"));
        let graph = builder.materialize().unwrap();

        assert!(graph.terminal(&req("t", "A")).is_none());
        assert_eq!(sink.failures.lock().len(), 1);
        assert_eq!(builder.failures().len(), 1);
    }

    #[test]
    fn faults_fail_only_their_own_task() {
        struct FlakyCatalogue {
            inner: Catalogue,
        }

        impl FunctionResolver for FlakyCatalogue {
            fn candidates(
                &self,
                requirement: &Requirement,
            ) -> anyhow::Result<Vec<Arc<dyn CandidateFunction>>> {
                if &*requirement.value_name == "Bad" {
                    anyhow::bail!("catalogue backend offline");
                }
                self.inner.candidates(requirement)
            }
        }

        let (catalogue, raw) = pricing_setup();
        let sink = Arc::new(RecordingSink::default());
        let builder = BuilderConfig::new(Arc::new(FlakyCatalogue { inner: catalogue }))
            .availability(Arc::new(raw))
            .diagnostics(sink.clone())
            .worker_cap(0)
            .finish();
        builder.submit_all([req("t1", "Pv"), req("t1", "Bad")]);
        let graph = builder.materialize().unwrap();

        assert_eq!(graph.terminal(&req("t1", "Pv")), Some(&spec("t1", "Pv", "f_pv")));
        assert!(graph.terminal(&req("t1", "Bad")).is_none());
        assert_eq!(
            builder.fault_tally().get("catalogue backend offline"),
            Some(&1)
        );
        assert_eq!(sink.failures.lock().len(), 1);
    }

    #[test]
    fn contended_gate_defers_but_completes() {
        let gate = Arc::new(AtomicBool::new(false));
        let mut catalogue = Catalogue::default();
        for target in ["t1", "t2"] {
            let output = spec(target, "Price", "quoter");
            catalogue.add(
                target,
                "Price",
                TestFunction::new(
                    "quoter",
                    vec![],
                    Box::new(move |_, _, _| {
                        std::thread::sleep(Duration::from_millis(5));
                        Validation::Accept(output.clone())
                    }),
                )
                .gated(gate.clone()),
            );
        }

        let builder = builder_with(catalogue, RawInputs::default(), 2);
        builder.submit_all([req("t1", "Price"), req("t2", "Price")]);
        let graph = builder.materialize().unwrap();
        assert_eq!(graph.terminals.len(), 2);
    }

    #[test]
    fn gate_is_not_held_while_awaiting_inputs() {
        // One shared gate guards a function used both at the root and inside
        // the root's own input subtree; holding it across the wait would
        // starve the inner task forever.
        let gate = Arc::new(AtomicBool::new(false));
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t1",
            "Price",
            TestFunction::accepting(
                "quoter",
                vec![req("t2", "Price")],
                spec("t1", "Price", "quoter"),
            )
            .gated(gate.clone()),
        );
        catalogue.add(
            "t2",
            "Price",
            TestFunction::accepting("quoter", vec![], spec("t2", "Price", "quoter")).gated(gate),
        );

        let builder = builder_with(catalogue, RawInputs::default(), 0);
        builder.submit(req("t1", "Price"));
        let graph = builder.materialize().unwrap();

        assert_eq!(
            graph.terminal(&req("t1", "Price")),
            Some(&spec("t1", "Price", "quoter"))
        );
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn raising_the_cap_resumes_background_building() {
        let (catalogue, raw) = pricing_setup();
        let builder = builder_with(catalogue, raw, 0);
        builder.submit(req("t1", "Pv"));

        assert!(builder.poll_graph().is_none());
        assert_eq!(builder.outstanding(), vec![req("t1", "Pv")]);

        builder.set_worker_cap(2);
        let mut graph = None;
        for _ in 0..1000 {
            if let Some(done) = builder.poll_graph() {
                graph = Some(done);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let graph = graph.expect("background workers should finish the build");
        assert_eq!(graph.terminal(&req("t1", "Pv")), Some(&spec("t1", "Pv", "f_pv")));
        assert!(builder.outstanding().is_empty());
        assert_eq!(builder.resolutions().len(), 1);
    }

    #[test]
    fn committed_exclusion_group_skips_matching_candidates() {
        let mut catalogue = Catalogue::default();
        catalogue.add(
            "t",
            "Top",
            TestFunction::accepting("ta", vec![req("t", "Sub")], spec("t", "Top", "ta"))
                .grouped("bootstrap"),
        );
        catalogue.add(
            "t",
            "Sub",
            TestFunction::accepting("s1", vec![], spec("t", "Sub", "s1")).grouped("bootstrap"),
        );
        catalogue.add("t", "Sub", TestFunction::accepting("s2", vec![], spec("t", "Sub", "s2")));

        let builder = builder_with(catalogue, RawInputs::default(), 0);
        builder.submit(req("t", "Top"));
        let graph = builder.materialize().unwrap();

        assert!(graph
            .invocations()
            .any(|invocation| invocation.function == FunctionId::new("s2")));
        assert!(!graph
            .invocations()
            .any(|invocation| invocation.function == FunctionId::new("s1")));
    }

    #[test]
    fn housekeeping_unravels_unreferenced_chains() {
        let (catalogue, raw) = pricing_setup();
        let builder = builder_with(catalogue, raw, 0);
        builder.submit(req("t1", "Pv"));
        builder.materialize().unwrap();

        let mut evicted = 0;
        for _ in 0..10 {
            evicted += builder.housekeep();
        }
        // pv, curve and the two raw leaves
        assert_eq!(evicted, 4);
        assert_eq!(builder.live_tasks(), 0);
    }
}
