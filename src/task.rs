//! The backtracking search unit and its step driver.
//!
//! A [`ResolveTask`] resolves one requirement along one recursion path. Tasks
//! live in an id-indexed [`Arena`]; consumers reference them by [`TaskId`] and
//! hold explicit reference counts, so the parent/child web never forms owning
//! cycles and loop abort can walk it as plain data.
//!
//! The step driver ([`run_step`]) advances a task through
//! `Created → TryingCandidate → AwaitingInputs/AwaitingAdditional →
//! Validating → {Published | Pumping | Exhausted}`. Collaborator calls
//! (catalogue, validation, gates) always happen with the task lock released;
//! an attempt epoch counter makes deliveries from abandoned attempts inert.
//!
//! Locking discipline, relied on throughout:
//! * at most one task lock is held at any time;
//! * cache and queue locks are only taken while no task lock is held, except
//!   for the shard-level map entries noted in `cache`;
//! * callbacks are collected under the publisher's lock but invoked after it
//!   is released; consumers that received a published value stay bound to the
//!   producer and are re-notified if a pump replaces that value.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::builder::Shared;
use crate::context::GraphBuildingContext;
use crate::model::{FunctionInvocation, Requirement, ResolvedValue};
use crate::resolver::{
    CandidateFunction, CandidateRejection, RejectionReason, ResolutionFailure, Validation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Id-indexed storage for all live tasks.
#[derive(Default)]
pub(crate) struct Arena {
    tasks: DashMap<TaskId, Arc<Mutex<ResolveTask>>>,
    next: AtomicU64,
}

impl Arena {
    pub(crate) fn insert(&self, requirement: Requirement, path: AncestorPath) -> TaskId {
        let id = TaskId(self.next.fetch_add(1, Ordering::Relaxed));
        let task = ResolveTask::new(id, requirement, path);
        self.tasks.insert(id, Arc::new(Mutex::new(task)));
        id
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<Arc<Mutex<ResolveTask>>> {
        self.tasks.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub(crate) fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// The chain of requirements currently under resolution above a task,
/// together with the exclusion group committed by each ancestor's candidate.
///
/// Shared immutably; extending the path never mutates an ancestor's view.
#[derive(Clone, Default)]
pub(crate) struct AncestorPath(Option<Arc<PathNode>>);

pub(crate) struct PathNode {
    requirement: Requirement,
    group: Option<Arc<str>>,
    parent: AncestorPath,
}

impl AncestorPath {
    pub(crate) fn root() -> Self {
        Self(None)
    }

    pub(crate) fn child(&self, requirement: Requirement, group: Option<Arc<str>>) -> Self {
        Self(Some(Arc::new(PathNode {
            requirement,
            group,
            parent: self.clone(),
        })))
    }

    pub(crate) fn contains(&self, requirement: &Requirement) -> bool {
        let mut node = &self.0;
        while let Some(current) = node {
            if current.requirement == *requirement {
                return true;
            }
            node = &current.parent.0;
        }
        false
    }

    pub(crate) fn excludes(&self, group: &str) -> bool {
        let mut node = &self.0;
        while let Some(current) = node {
            if current.group.as_deref() == Some(group) {
                return true;
            }
            node = &current.parent.0;
        }
        false
    }

    /// Ancestor requirements, innermost first.
    pub(crate) fn requirements(&self) -> Vec<Requirement> {
        let mut out = Vec::new();
        let mut node = &self.0;
        while let Some(current) = node {
            out.push(current.requirement.clone());
            node = &current.parent.0;
        }
        out
    }
}

/// Which slot of the consuming task a delivery is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotRef {
    Input(usize),
    Additional(usize),
}

/// A registered continuation. Parent callbacks stay bound to a publishing
/// producer and are re-notified when a pump replaces the published value.
#[derive(Clone)]
pub(crate) enum Callback {
    /// Fill a slot of a consuming task.
    Parent {
        task: TaskId,
        slot: SlotRef,
        epoch: u64,
        /// The slot generation this delivery is destined for.
        generation: u64,
    },
    /// Record a top-level outcome in the terminal accumulator.
    Terminal { requirement: Requirement },
}

#[derive(Clone)]
pub(crate) enum Outcome {
    Value(Arc<ResolvedValue>),
    Failed(Arc<ResolutionFailure>),
}

/// One declared or demanded input of the candidate under trial.
pub(crate) struct InputSlot {
    pub(crate) requirement: Requirement,
    pub(crate) producer: Option<TaskId>,
    pub(crate) value: Option<Arc<ResolvedValue>>,
    /// Bumped each time this slot is pumped; a delivery carrying a lower
    /// generation is stale.
    pub(crate) generation: u64,
}

impl InputSlot {
    fn new(requirement: Requirement) -> Self {
        Self {
            requirement,
            producer: None,
            value: None,
            generation: 0,
        }
    }
}

pub(crate) enum TaskState {
    Created,
    TryingCandidate,
    AwaitingInputs { outstanding: usize },
    AwaitingAdditional { outstanding: usize },
    Validating,
    Pumping,
    Published(Arc<ResolvedValue>),
    Exhausted(Arc<ResolutionFailure>),
}

impl TaskState {
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self, TaskState::Published(_) | TaskState::Exhausted(_))
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(
            self,
            TaskState::AwaitingInputs { .. } | TaskState::AwaitingAdditional { .. }
        )
    }
}

pub(crate) struct ResolveTask {
    pub(crate) id: TaskId,
    pub(crate) requirement: Requirement,
    pub(crate) path: AncestorPath,
    pub(crate) state: TaskState,
    pub(crate) candidates: Vec<Arc<dyn CandidateFunction>>,
    pub(crate) cursor: usize,
    pub(crate) current: Option<Arc<dyn CandidateFunction>>,
    /// Whether the current candidate's concurrency gate is held.
    pub(crate) holds_token: bool,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) additional: Vec<InputSlot>,
    pub(crate) callbacks: Vec<Callback>,
    /// Consumers holding the currently published value; re-notified when a
    /// pump replaces it.
    pub(crate) bound: Vec<Callback>,
    pub(crate) attempts: Vec<CandidateRejection>,
    /// Number of consumer slots referencing this task as their producer.
    pub(crate) refs: usize,
    /// Attempt epoch; bumped whenever pending deliveries become void.
    pub(crate) epoch: u64,
    /// Bumped when a bound slot is rebound to a re-published value, so an
    /// in-flight validation of the old inputs discards its verdict.
    pub(crate) revision: u64,
    /// Guards against double-enqueueing on the run queue.
    pub(crate) enqueued: bool,
}

impl ResolveTask {
    fn new(id: TaskId, requirement: Requirement, path: AncestorPath) -> Self {
        Self {
            id,
            requirement,
            path,
            state: TaskState::Created,
            candidates: Vec::new(),
            cursor: 0,
            current: None,
            holds_token: false,
            inputs: Vec::new(),
            additional: Vec::new(),
            callbacks: Vec::new(),
            bound: Vec::new(),
            attempts: Vec::new(),
            refs: 0,
            epoch: 0,
            revision: 0,
            enqueued: false,
        }
    }

    fn slot(&self, slot: SlotRef) -> Option<&InputSlot> {
        match slot {
            SlotRef::Input(index) => self.inputs.get(index),
            SlotRef::Additional(index) => self.additional.get(index),
        }
    }

    fn slot_mut(&mut self, slot: SlotRef) -> Option<&mut InputSlot> {
        match slot {
            SlotRef::Input(index) => self.inputs.get_mut(index),
            SlotRef::Additional(index) => self.additional.get_mut(index),
        }
    }

    /// Whether a pump could plausibly yield another resolution: either more
    /// candidates remain, or some input has a producer that might itself be
    /// pumped.
    fn more_alternatives(&self) -> bool {
        self.cursor + 1 < self.candidates.len()
            || self.inputs.iter().any(|slot| slot.producer.is_some())
    }

    /// Drops slot contents and returns the producer ids whose reference
    /// counts must be released once this task's lock is gone.
    pub(crate) fn clear_slots(&mut self, inputs: bool, additional: bool) -> Vec<TaskId> {
        let mut producers = Vec::new();
        if inputs {
            for slot in self.inputs.drain(..) {
                producers.extend(slot.producer);
            }
        }
        if additional {
            for slot in self.additional.drain(..) {
                producers.extend(slot.producer);
            }
        }
        producers
    }

    /// Adds a consumer to the bound list, displacing any earlier registration
    /// for the same destination.
    fn bind_consumer(&mut self, callback: Callback) {
        match &callback {
            Callback::Parent { task, slot, .. } => {
                self.bound.retain(|existing| {
                    !matches!(existing, Callback::Parent { task: t, slot: s, .. }
                        if t == task && s == slot)
                });
            }
            Callback::Terminal { requirement } => {
                self.bound.retain(|existing| {
                    !matches!(existing, Callback::Terminal { requirement: r }
                        if r == requirement)
                });
            }
        }
        self.bound.push(callback);
    }

    /// Gives up the concurrency gate, returning the candidate to release.
    fn surrender_token(&mut self) -> Option<Arc<dyn CandidateFunction>> {
        if self.holds_token {
            self.holds_token = false;
            self.current.clone()
        } else {
            None
        }
    }
}

/// What a worker should do with the unit it just ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitOutcome {
    Completed,
    /// The candidate's gate is contended; park on the deferred queue.
    Deferred,
}

/// Decrements the reference count of each listed task. Callers must not hold
/// any task lock.
pub(crate) fn release_refs(shared: &Shared, producers: Vec<TaskId>) {
    for id in producers {
        if let Some(handle) = shared.arena.get(id) {
            let mut task = handle.lock();
            task.refs = task.refs.saturating_sub(1);
        }
    }
}

/// Looks up or creates the task responsible for `requirement`, retrying if
/// the cache bucket races with an eviction.
pub(crate) fn resolve_child(
    shared: &Shared,
    requirement: &Requirement,
    path: &AncestorPath,
) -> (TaskId, Arc<Mutex<ResolveTask>>, bool) {
    loop {
        let (id, created) = shared.cache.get_or_create_task(requirement.clone(), || {
            shared.arena.insert(requirement.clone(), path.clone())
        });
        if let Some(handle) = shared.arena.get(id) {
            return (id, handle, created);
        }
        // The bucket pointed at a task evicted between lookup and fetch.
        shared.cache.evict_task(requirement, id);
    }
}

/// Registers `callback` on the child, or returns the child's settled outcome
/// for synchronous delivery. Bumps the child's reference count when
/// `bump_ref` is set (consumer slots hold references, terminals do not).
pub(crate) fn register_or_outcome(
    handle: &Arc<Mutex<ResolveTask>>,
    callback: Callback,
    bump_ref: bool,
) -> Option<Outcome> {
    let mut task = handle.lock();
    if bump_ref {
        task.refs += 1;
    }
    match &task.state {
        TaskState::Published(value) => {
            let value = value.clone();
            // Late attachers stay bound too, so a later pump reaches them.
            task.bind_consumer(callback);
            Some(Outcome::Value(value))
        }
        TaskState::Exhausted(failure) => Some(Outcome::Failed(failure.clone())),
        _ => {
            task.callbacks.push(callback);
            None
        }
    }
}

/// Wires one input requirement of `parent` to its producing task, creating
/// and scheduling the producer if this is the first interest in it.
fn attach_input(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    parent: TaskId,
    slot: SlotRef,
    epoch: u64,
    requirement: Requirement,
    path: &AncestorPath,
) {
    let (child, handle, created) = resolve_child(shared, &requirement, path);
    let callback = Callback::Parent {
        task: parent,
        slot,
        epoch,
        // Slots are freshly created on every attempt.
        generation: 0,
    };
    let outcome = register_or_outcome(&handle, callback.clone(), true);

    if created {
        let mut task = handle.lock();
        if !task.enqueued {
            task.enqueued = true;
            ctx.enqueue(child);
        }
    }

    // Bind the producer to the slot; if the attempt was abandoned in the
    // meantime the reference taken above has no holder and is given back.
    let mut stale = false;
    if let Some(parent_handle) = shared.arena.get(parent) {
        let mut task = parent_handle.lock();
        if task.epoch == epoch {
            if let Some(slot) = task.slot_mut(slot) {
                slot.producer = Some(child);
            } else {
                stale = true;
            }
        } else {
            stale = true;
        }
    } else {
        stale = true;
    }
    if stale {
        release_refs(shared, vec![child]);
        return;
    }

    if let Some(outcome) = outcome {
        deliver(shared, ctx, callback, outcome);
    }
}

/// Advances one task until it parks. Returns how the unit ended.
pub(crate) fn run_step(shared: &Shared, ctx: &mut GraphBuildingContext, id: TaskId) -> UnitOutcome {
    let Some(handle) = shared.arena.get(id) else {
        return UnitOutcome::Completed;
    };
    {
        let mut task = handle.lock();
        task.enqueued = false;
    }

    loop {
        let mut task = handle.lock();
        match &task.state {
            TaskState::Published(_) | TaskState::Exhausted(_) => return UnitOutcome::Completed,

            // Nothing to do until deliveries arrive.
            TaskState::AwaitingInputs { .. } | TaskState::AwaitingAdditional { .. } => {
                return UnitOutcome::Completed;
            }

            TaskState::Created => {
                let requirement = task.requirement.clone();
                drop(task);

                if let Some(specification) = shared.availability.available(&requirement) {
                    debug!("{id} resolves {requirement} from raw input {specification}");
                    let value = shared
                        .cache
                        .publish_resolved(Arc::new(ResolvedValue::leaf(specification)));
                    publish(shared, ctx, &handle, value);
                    return UnitOutcome::Completed;
                }

                match shared.resolver.candidates(&requirement) {
                    Ok(candidates) => {
                        debug!("{id} has {} candidates for {requirement}", candidates.len());
                        let mut task = handle.lock();
                        task.candidates = candidates;
                        task.state = TaskState::TryingCandidate;
                    }
                    Err(error) => {
                        fail_with_fault(shared, ctx, &handle, None, &error);
                        return UnitOutcome::Completed;
                    }
                }
            }

            TaskState::TryingCandidate => {
                // Scan forward to the next admissible candidate.
                let selected = loop {
                    if task.cursor >= task.candidates.len() {
                        break None;
                    }
                    let candidate = task.candidates[task.cursor].clone();
                    if let Some(group) = candidate.exclusion_group()
                        && task.path.excludes(group)
                    {
                        debug!("{id} skips {}: group '{group}' held upstream", candidate.id());
                        let rejection = CandidateRejection {
                            function: Some(candidate.id()),
                            reason: RejectionReason::Excluded(group.to_string()),
                        };
                        task.attempts.push(rejection);
                        task.cursor += 1;
                        continue;
                    }
                    break Some(candidate);
                };

                let Some(candidate) = selected else {
                    drop(task);
                    exhaust(shared, ctx, &handle);
                    return UnitOutcome::Completed;
                };
                let requirement = task.requirement.clone();
                let epoch = task.epoch;
                drop(task);

                let declared = match candidate.inputs(&requirement) {
                    Ok(declared) => declared,
                    Err(error) => {
                        fail_with_fault(shared, ctx, &handle, Some(candidate.id()), &error);
                        return UnitOutcome::Completed;
                    }
                };

                let mut task = handle.lock();
                if task.epoch != epoch || !matches!(task.state, TaskState::TryingCandidate) {
                    return UnitOutcome::Completed;
                }

                // Recursion guard: never re-enter a requirement already under
                // resolution on this path.
                if declared
                    .iter()
                    .any(|input| *input == task.requirement || task.path.contains(input))
                {
                    debug!("{id} rejects {}: recursive input", candidate.id());
                    let rejection = CandidateRejection {
                        function: Some(candidate.id()),
                        reason: RejectionReason::Recursive,
                    };
                    task.attempts.push(rejection);
                    task.cursor += 1;
                    drop(task);
                    continue;
                }

                task.current = Some(candidate.clone());
                task.inputs = declared.iter().cloned().map(InputSlot::new).collect();
                task.additional.clear();

                if declared.is_empty() {
                    task.state = TaskState::Validating;
                    continue;
                }

                debug!("{id} tries {} with {} inputs", candidate.id(), declared.len());
                task.state = TaskState::AwaitingInputs {
                    outstanding: declared.len(),
                };
                let group = candidate.exclusion_group().map(Arc::from);
                let child_path = task.path.child(task.requirement.clone(), group);
                drop(task);

                for (index, input) in declared.into_iter().enumerate() {
                    attach_input(shared, ctx, id, SlotRef::Input(index), epoch, input, &child_path);
                }
                return UnitOutcome::Completed;
            }

            TaskState::Validating => {
                let Some(candidate) = task.current.clone() else {
                    task.state = TaskState::TryingCandidate;
                    continue;
                };
                let epoch = task.epoch;
                let revision = task.revision;

                let requirement = task.requirement.clone();
                let inputs: Option<Vec<_>> =
                    task.inputs.iter().map(|slot| slot.value.clone()).collect();
                let additional: Option<Vec<_>> =
                    task.additional.iter().map(|slot| slot.value.clone()).collect();
                let (Some(inputs), Some(additional)) = (inputs, additional) else {
                    warn!("{id} validating with an unfilled slot; parking");
                    return UnitOutcome::Completed;
                };

                // The gate is held only around the validation call itself,
                // never across waits on inputs.
                if !task.holds_token {
                    drop(task);
                    if !candidate.try_acquire() {
                        debug!("{id} deferred: {} is contended", candidate.id());
                        return UnitOutcome::Deferred;
                    }
                    let mut task = handle.lock();
                    if task.epoch != epoch || !matches!(task.state, TaskState::Validating) {
                        drop(task);
                        candidate.release();
                        return UnitOutcome::Completed;
                    }
                    task.holds_token = true;
                    continue;
                }
                drop(task);

                let verdict = match candidate.validate(&requirement, &inputs, &additional) {
                    Ok(verdict) => verdict,
                    Err(error) => {
                        fail_with_fault(shared, ctx, &handle, Some(candidate.id()), &error);
                        return UnitOutcome::Completed;
                    }
                };

                match verdict {
                    Validation::Accept(specification) => {
                        if !specification.satisfies(&requirement) {
                            let mut task = handle.lock();
                            if task.epoch != epoch
                                || task.revision != revision
                                || !matches!(task.state, TaskState::Validating)
                            {
                                return UnitOutcome::Completed;
                            }
                            let rejection = CandidateRejection {
                                function: Some(candidate.id()),
                                reason: RejectionReason::Validation(format!(
                                    "accepted specification {specification} does not satisfy the requirement"
                                )),
                            };
                            task.attempts.push(rejection);
                            task.state = TaskState::Pumping;
                            let release = task.surrender_token();
                            drop(task);
                            if let Some(candidate) = release {
                                candidate.release();
                            }
                            continue;
                        }

                        let bound: Vec<_> =
                            inputs.iter().chain(additional.iter()).cloned().collect();
                        // A memoized value is reused only when it was built
                        // from the same input combination; a re-validation
                        // with pumped inputs replaces the stored value.
                        let reusable =
                            shared.cache.lookup_resolved(&specification).filter(|cached| {
                                cached.invocation.inputs.len() == bound.len()
                                    && cached
                                        .invocation
                                        .inputs
                                        .iter()
                                        .zip(bound.iter())
                                        .all(|(spec, input)| *spec == input.specification)
                            });
                        let value = match reusable {
                            Some(value) => value,
                            None => {
                                let invocation = Arc::new(FunctionInvocation {
                                    function: candidate.id(),
                                    target: specification.target.clone(),
                                    inputs: bound
                                        .iter()
                                        .map(|value| value.specification.clone())
                                        .collect(),
                                    outputs: vec![specification.clone()],
                                });
                                shared.cache.replace_resolved(Arc::new(ResolvedValue {
                                    specification,
                                    invocation,
                                    inputs: bound,
                                }))
                            }
                        };

                        {
                            let task = handle.lock();
                            if task.epoch != epoch
                                || task.revision != revision
                                || !matches!(task.state, TaskState::Validating)
                            {
                                // A slot was rebound mid-validation; the
                                // verdict is stale and the rebind already
                                // re-enqueued this task.
                                return UnitOutcome::Completed;
                            }
                        }
                        publish(shared, ctx, &handle, value);
                        return UnitOutcome::Completed;
                    }

                    Validation::Reject(reason) => {
                        debug!("{id}: {} rejected: {reason}", candidate.id());
                        let mut task = handle.lock();
                        if task.epoch != epoch
                            || task.revision != revision
                            || !matches!(task.state, TaskState::Validating)
                        {
                            return UnitOutcome::Completed;
                        }
                        let rejection = CandidateRejection {
                            function: Some(candidate.id()),
                            reason: RejectionReason::Validation(reason),
                        };
                        task.attempts.push(rejection);
                        task.state = TaskState::Pumping;
                        let release = task.surrender_token();
                        drop(task);
                        if let Some(candidate) = release {
                            candidate.release();
                        }
                    }

                    Validation::Demand(demands) => {
                        let mut task = handle.lock();
                        if task.epoch != epoch
                            || task.revision != revision
                            || !matches!(task.state, TaskState::Validating)
                        {
                            return UnitOutcome::Completed;
                        }
                        if demands.is_empty() {
                            let rejection = CandidateRejection {
                                function: Some(candidate.id()),
                                reason: RejectionReason::Validation(
                                    "demanded no additional inputs".into(),
                                ),
                            };
                            task.attempts.push(rejection);
                            task.state = TaskState::Pumping;
                            let release = task.surrender_token();
                            drop(task);
                            if let Some(candidate) = release {
                                candidate.release();
                            }
                            continue;
                        }
                        if demands
                            .iter()
                            .any(|input| *input == task.requirement || task.path.contains(input))
                        {
                            let rejection = CandidateRejection {
                                function: Some(candidate.id()),
                                reason: RejectionReason::Recursive,
                            };
                            task.attempts.push(rejection);
                            let released = task.clear_slots(false, true);
                            task.state = TaskState::Pumping;
                            let release = task.surrender_token();
                            drop(task);
                            if let Some(candidate) = release {
                                candidate.release();
                            }
                            release_refs(shared, released);
                            continue;
                        }

                        debug!("{id}: {} demands {} more inputs", candidate.id(), demands.len());
                        let base = task.additional.len();
                        task.additional
                            .extend(demands.iter().cloned().map(InputSlot::new));
                        task.state = TaskState::AwaitingAdditional {
                            outstanding: demands.len(),
                        };
                        let group = candidate.exclusion_group().map(Arc::from);
                        let child_path = task.path.child(task.requirement.clone(), group);
                        let release = task.surrender_token();
                        drop(task);
                        if let Some(candidate) = release {
                            candidate.release();
                        }

                        for (offset, demand) in demands.into_iter().enumerate() {
                            attach_input(
                                shared,
                                ctx,
                                id,
                                SlotRef::Additional(base + offset),
                                epoch,
                                demand,
                                &child_path,
                            );
                        }
                        return UnitOutcome::Completed;
                    }
                }
            }

            TaskState::Pumping => {
                let epoch = task.epoch;
                let pumpable: Vec<(usize, TaskId, u64)> = task
                    .inputs
                    .iter()
                    .enumerate()
                    .filter_map(|(index, slot)| {
                        let producer = slot.producer.or_else(|| {
                            // The direct link can be lost to eviction; the
                            // producer map still knows who made the value.
                            slot.value
                                .as_ref()
                                .and_then(|value| shared.cache.producer_of(&value.specification))
                        });
                        producer.map(|producer| (index, producer, slot.generation + 1))
                    })
                    .collect();
                drop(task);

                let mut accepted = None;
                for (index, producer, next_generation) in pumpable {
                    let callback = Callback::Parent {
                        task: id,
                        slot: SlotRef::Input(index),
                        epoch,
                        generation: next_generation,
                    };
                    if pump_child(shared, ctx, producer, callback) {
                        accepted = Some((index, next_generation));
                        break;
                    }
                }

                let mut task = handle.lock();
                if task.epoch != epoch || !matches!(task.state, TaskState::Pumping) {
                    return UnitOutcome::Completed;
                }
                match accepted {
                    Some((index, next_generation)) => {
                        debug!("{id} pumps input slot {index} for an alternative");
                        let released = task.clear_slots(false, true);
                        let refilled = match task.inputs.get_mut(index) {
                            // The replacement may already have been delivered
                            // before this lock was re-taken; the slot
                            // generation says so. Otherwise the stale value
                            // is dropped and the slot waits for the pumped
                            // delivery.
                            Some(slot) if slot.generation == next_generation => true,
                            Some(slot) => {
                                slot.generation = next_generation;
                                slot.value = None;
                                false
                            }
                            None => false,
                        };
                        if refilled {
                            task.state = TaskState::Validating;
                            drop(task);
                            release_refs(shared, released);
                            continue;
                        }
                        task.state = TaskState::AwaitingInputs { outstanding: 1 };
                        drop(task);
                        release_refs(shared, released);
                        return UnitOutcome::Completed;
                    }
                    None => {
                        // No input can offer an alternative; abandon the
                        // candidate and move down the priority order.
                        let release = task.surrender_token();
                        task.current = None;
                        let released = task.clear_slots(true, true);
                        task.cursor += 1;
                        task.epoch += 1;
                        task.state = TaskState::TryingCandidate;
                        drop(task);
                        if let Some(candidate) = release {
                            candidate.release();
                        }
                        release_refs(shared, released);
                    }
                }
            }
        }
    }
}

/// Asks a producing task for an alternative resolution. Returns whether the
/// pump was accepted; an accepted pump leaves `callback` registered for the
/// next outcome.
fn pump_child(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    child: TaskId,
    callback: Callback,
) -> bool {
    let Some(handle) = shared.arena.get(child) else {
        return false;
    };
    let mut task = handle.lock();
    match &task.state {
        TaskState::Exhausted(_) => false,
        TaskState::Published(_) => {
            if !task.more_alternatives() {
                return false;
            }
            debug!("{child} asked to pump");
            let rejection = CandidateRejection {
                function: task.current.as_ref().map(|candidate| candidate.id()),
                reason: RejectionReason::RejectedDownstream,
            };
            task.attempts.push(rejection);
            task.state = TaskState::Pumping;
            task.callbacks.push(callback);
            if !task.enqueued {
                task.enqueued = true;
                ctx.enqueue(child);
            }
            true
        }
        // Mid-flight: its next outcome is an alternative from our viewpoint.
        _ => {
            task.callbacks.push(callback);
            true
        }
    }
}

/// Settles a task as published and notifies every registered consumer.
///
/// Consumers stay bound after delivery; a re-publish after a pump notifies
/// everyone who received the previous value as well as newly registered
/// callbacks. Stale deliveries are dropped by the epoch and generation guards
/// on the receiving side.
pub(crate) fn publish(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    handle: &Arc<Mutex<ResolveTask>>,
    value: Arc<ResolvedValue>,
) {
    let (id, release, notify) = {
        let mut task = handle.lock();
        debug!("{} publishes {}", task.id, value.specification);
        let release = task.surrender_token();
        task.state = TaskState::Published(value.clone());
        for callback in std::mem::take(&mut task.callbacks) {
            task.bind_consumer(callback);
        }
        (task.id, release, task.bound.clone())
    };
    shared.cache.record_producer(value.specification.clone(), id);
    if let Some(candidate) = release {
        candidate.release();
    }
    for callback in notify {
        deliver(shared, ctx, callback, Outcome::Value(value.clone()));
    }
}

/// Settles a task as exhausted, carrying the accumulated rejection
/// provenance, and notifies every registered consumer of the failure.
pub(crate) fn exhaust(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    handle: &Arc<Mutex<ResolveTask>>,
) {
    let (failure, release, released, drained) = {
        let mut task = handle.lock();
        let failure = Arc::new(ResolutionFailure {
            requirement: task.requirement.clone(),
            attempts: std::mem::take(&mut task.attempts),
            ancestors: task.path.requirements(),
        });
        debug!("{} exhausted after {} attempts", task.id, failure.attempts.len());
        let release = task.surrender_token();
        task.current = None;
        let released = task.clear_slots(true, true);
        task.state = TaskState::Exhausted(failure.clone());
        // Bound consumers keep the last published value; only pending
        // registrations learn of the failure.
        task.bound.clear();
        (failure, release, released, std::mem::take(&mut task.callbacks))
    };
    if let Some(candidate) = release {
        candidate.release();
    }
    release_refs(shared, released);
    for callback in drained {
        deliver(shared, ctx, callback, Outcome::Failed(failure.clone()));
    }
}

/// Records an infrastructure fault and fails the owning task.
fn fail_with_fault(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    handle: &Arc<Mutex<ResolveTask>>,
    function: Option<crate::model::FunctionId>,
    error: &anyhow::Error,
) {
    ctx.record_fault(error);
    {
        let mut task = handle.lock();
        warn!("{} failed on a collaborator fault: {error:#}", task.id);
        let rejection = CandidateRejection {
            function,
            reason: RejectionReason::Fault(format!("{error:#}")),
        };
        task.attempts.push(rejection);
        task.epoch += 1;
    }
    exhaust(shared, ctx, handle);
}

/// Forcibly fails an unfinished task, recording `reason` against whatever
/// candidate it is holding. Used by loop abort and by panic recovery.
pub(crate) fn force_exhaust(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    id: TaskId,
    reason: RejectionReason,
) {
    let Some(handle) = shared.arena.get(id) else {
        return;
    };
    {
        let mut task = handle.lock();
        if task.state.is_finished() {
            return;
        }
        warn!("{id} forcibly failed: {reason}");
        let rejection = CandidateRejection {
            function: task.current.as_ref().map(|candidate| candidate.id()),
            reason,
        };
        task.attempts.push(rejection);
        task.epoch += 1;
    }
    exhaust(shared, ctx, &handle);
}

/// Delivers an outcome to a registered continuation.
pub(crate) fn deliver(
    shared: &Shared,
    ctx: &mut GraphBuildingContext,
    callback: Callback,
    outcome: Outcome,
) {
    let (parent, slot, epoch, generation) = match callback {
        Callback::Terminal { requirement } => {
            match outcome {
                Outcome::Value(value) => {
                    shared.terminals.lock().record_success(requirement, value);
                }
                Outcome::Failed(failure) => {
                    shared.sink.resolution_failed(&failure);
                    shared.terminals.lock().record_failure(requirement, failure);
                }
            }
            return;
        }
        Callback::Parent {
            task,
            slot,
            epoch,
            generation,
        } => (task, slot, epoch, generation),
    };

    let Some(handle) = shared.arena.get(parent) else {
        return;
    };
    let mut task = handle.lock();
    if task.epoch != epoch {
        return;
    }

    match outcome {
        Outcome::Value(value) => {
            let Some(slot) = task.slot_mut(slot) else {
                return;
            };
            if generation < slot.generation {
                // Delivery from before this slot was pumped.
                return;
            }
            if let Some(existing) = &slot.value {
                if Arc::ptr_eq(existing, &value) {
                    return;
                }
                // The producer re-published a different value; rebind the
                // slot and re-validate whatever was built on the old one.
                slot.value = Some(value);
                slot.generation = generation;
                task.revision += 1;
                match &task.state {
                    TaskState::Published(_) | TaskState::Validating => {
                        task.state = TaskState::Validating;
                        if !task.enqueued {
                            task.enqueued = true;
                            ctx.enqueue(parent);
                        }
                    }
                    // Pending demands were tied to the old input combination.
                    TaskState::AwaitingAdditional { .. } => {
                        let released = task.clear_slots(false, true);
                        task.state = TaskState::Validating;
                        if !task.enqueued {
                            task.enqueued = true;
                            ctx.enqueue(parent);
                        }
                        drop(task);
                        release_refs(shared, released);
                    }
                    _ => {}
                }
                return;
            }
            slot.value = Some(value);
            slot.generation = generation;
            match &mut task.state {
                TaskState::AwaitingInputs { outstanding }
                | TaskState::AwaitingAdditional { outstanding } => {
                    *outstanding -= 1;
                    if *outstanding == 0 {
                        task.state = TaskState::Validating;
                        if !task.enqueued {
                            task.enqueued = true;
                            ctx.enqueue(parent);
                        }
                    }
                }
                // A pumped producer re-published before the pumping step
                // finished; it picks the value up on its next lock.
                TaskState::Pumping => {}
                _ => {}
            }
        }

        Outcome::Failed(_) => match &task.state {
            // An unresolvable input kills the whole candidate.
            TaskState::AwaitingInputs { .. } | TaskState::Pumping => {
                let failed = task.slot(slot).map(|slot| slot.requirement.clone());
                let Some(failed) = failed else {
                    return;
                };
                let rejection = CandidateRejection {
                    function: task.current.as_ref().map(|candidate| candidate.id()),
                    reason: RejectionReason::UnresolvedInput(failed),
                };
                task.attempts.push(rejection);
                let release = task.surrender_token();
                task.current = None;
                let released = task.clear_slots(true, true);
                task.cursor += 1;
                task.epoch += 1;
                task.state = TaskState::TryingCandidate;
                if !task.enqueued {
                    task.enqueued = true;
                    ctx.enqueue(parent);
                }
                drop(task);
                if let Some(candidate) = release {
                    candidate.release();
                }
                release_refs(shared, released);
            }

            // Additional demands are tied to the current input combination;
            // drop them and pump the inputs for a different combination.
            TaskState::AwaitingAdditional { .. } => {
                let failed = task.slot(slot).map(|slot| slot.requirement.clone());
                let Some(failed) = failed else {
                    return;
                };
                let rejection = CandidateRejection {
                    function: task.current.as_ref().map(|candidate| candidate.id()),
                    reason: RejectionReason::UnresolvedAdditional(failed),
                };
                task.attempts.push(rejection);
                let released = task.clear_slots(false, true);
                task.epoch += 1;
                task.state = TaskState::Pumping;
                if !task.enqueued {
                    task.enqueued = true;
                    ctx.enqueue(parent);
                }
                drop(task);
                release_refs(shared, released);
            }

            _ => {}
        },
    }
}
