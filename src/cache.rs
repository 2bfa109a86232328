//! The resolution cache: three concurrently-accessed maps.
//!
//! * requirement → task entry, the dedup point: one live task per distinct
//!   requirement at a time;
//! * specification → producing task, used to attach mid-flight consumers;
//! * specification → resolved value, the memoization table.
//!
//! All three are sharded maps; lookups and inserts contend only within a
//! shard. A requirement bucket can hold a [`CacheEntry::Tombstone`], meaning
//! "inspected and evicted"; housekeeping skips tombstoned buckets and the
//! next `get_or_create_task` for that requirement revives the bucket with a
//! fresh task.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::model::{Requirement, ResolvedValue, Specification};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheEntry {
    /// A previously evicted bucket. Kept so housekeeping can tell "already
    /// cleaned" from "never seen".
    Tombstone,
    Live(TaskId),
}

#[derive(Debug, Default)]
pub(crate) struct ResolutionCache {
    tasks: DashMap<Requirement, CacheEntry>,
    producers: DashMap<Specification, TaskId>,
    resolved: DashMap<Specification, Arc<ResolvedValue>>,
}

impl ResolutionCache {
    /// Returns the task responsible for `requirement`, creating one through
    /// `create` if the bucket is vacant or tombstoned. The boolean is `true`
    /// when a new task was created.
    ///
    /// Atomic per requirement: two concurrent callers get the same task id
    /// and exactly one of them observes `true`.
    pub(crate) fn get_or_create_task(
        &self,
        requirement: Requirement,
        create: impl FnOnce() -> TaskId,
    ) -> (TaskId, bool) {
        match self.tasks.entry(requirement) {
            Entry::Occupied(mut occupied) => match *occupied.get() {
                CacheEntry::Live(id) => (id, false),
                CacheEntry::Tombstone => {
                    let id = create();
                    occupied.insert(CacheEntry::Live(id));
                    (id, true)
                }
            },
            Entry::Vacant(vacant) => {
                let id = create();
                vacant.insert(CacheEntry::Live(id));
                (id, true)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn task_for(&self, requirement: &Requirement) -> Option<TaskId> {
        self.tasks.get(requirement).and_then(|entry| match *entry {
            CacheEntry::Live(id) => Some(id),
            CacheEntry::Tombstone => None,
        })
    }

    /// Tombstones the bucket for `requirement` if it still points at `task`.
    /// Returns whether the eviction happened.
    pub(crate) fn evict_task(&self, requirement: &Requirement, task: TaskId) -> bool {
        let mut evicted = false;
        if let Some(mut entry) = self.tasks.get_mut(requirement)
            && *entry == CacheEntry::Live(task)
        {
            *entry = CacheEntry::Tombstone;
            evicted = true;
        }
        evicted
    }

    pub(crate) fn record_producer(&self, specification: Specification, task: TaskId) {
        self.producers.insert(specification, task);
    }

    pub(crate) fn producer_of(&self, specification: &Specification) -> Option<TaskId> {
        self.producers.get(specification).map(|entry| *entry)
    }

    /// Drops producer entries not accepted by `keep`.
    pub(crate) fn retain_producers(&self, mut keep: impl FnMut(TaskId) -> bool) {
        self.producers.retain(|_, task| keep(*task));
    }

    /// Records a resolved value; the first writer for a specification wins
    /// and everyone gets the winning `Arc` back.
    pub(crate) fn publish_resolved(&self, value: Arc<ResolvedValue>) -> Arc<ResolvedValue> {
        self.resolved
            .entry(value.specification.clone())
            .or_insert(value)
            .clone()
    }

    /// Records a resolved value unconditionally, replacing any previous value
    /// for the specification. Used when a re-validation binds the same
    /// specification to a different input combination.
    pub(crate) fn replace_resolved(&self, value: Arc<ResolvedValue>) -> Arc<ResolvedValue> {
        self.resolved.insert(value.specification.clone(), value.clone());
        value
    }

    pub(crate) fn lookup_resolved(&self, specification: &Specification) -> Option<Arc<ResolvedValue>> {
        self.resolved.get(specification).map(|entry| entry.clone())
    }

    /// Number of distinct resolved specifications.
    pub(crate) fn resolutions(&self) -> usize {
        self.resolved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FunctionId, TargetRef};

    fn req(name: &str) -> Requirement {
        Requirement::new(TargetRef::new("t"), name)
    }

    fn spec(name: &str) -> Specification {
        Specification::new(TargetRef::new("t"), name, FunctionId::new("f"))
    }

    #[test]
    fn create_is_once_per_requirement() {
        let cache = ResolutionCache::default();
        let (a, created_a) = cache.get_or_create_task(req("Price"), || TaskId(1));
        let (b, created_b) = cache.get_or_create_task(req("Price"), || TaskId(2));
        assert_eq!(a, TaskId(1));
        assert_eq!(b, TaskId(1));
        assert!(created_a);
        assert!(!created_b);
    }

    #[test]
    fn tombstone_revives_with_fresh_task() {
        let cache = ResolutionCache::default();
        let (_, _) = cache.get_or_create_task(req("Price"), || TaskId(1));
        assert!(cache.evict_task(&req("Price"), TaskId(1)));
        assert_eq!(cache.task_for(&req("Price")), None);
        let (id, created) = cache.get_or_create_task(req("Price"), || TaskId(2));
        assert_eq!(id, TaskId(2));
        assert!(created);
    }

    #[test]
    fn evict_is_guarded_by_task_identity() {
        let cache = ResolutionCache::default();
        let (_, _) = cache.get_or_create_task(req("Price"), || TaskId(1));
        assert!(!cache.evict_task(&req("Price"), TaskId(9)));
        assert_eq!(cache.task_for(&req("Price")), Some(TaskId(1)));
    }

    #[test]
    fn first_resolved_writer_wins() {
        let cache = ResolutionCache::default();
        let first = Arc::new(ResolvedValue::leaf(spec("Price")));
        let second = Arc::new(ResolvedValue::leaf(spec("Price")));
        let won = cache.publish_resolved(first.clone());
        assert!(Arc::ptr_eq(&won, &first));
        let won = cache.publish_resolved(second);
        assert!(Arc::ptr_eq(&won, &first));
        assert_eq!(cache.resolutions(), 1);
    }

    #[test]
    fn replace_overwrites_a_memoized_value() {
        let cache = ResolutionCache::default();
        let first = Arc::new(ResolvedValue::leaf(spec("Price")));
        cache.publish_resolved(first);
        let second = Arc::new(ResolvedValue::leaf(spec("Price")));
        let won = cache.replace_resolved(second.clone());
        assert!(Arc::ptr_eq(&won, &second));
        let looked_up = cache.lookup_resolved(&spec("Price")).unwrap();
        assert!(Arc::ptr_eq(&looked_up, &second));
        assert_eq!(cache.resolutions(), 1);
    }
}
