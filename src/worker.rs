//! Worker jobs and the executor they are spawned onto.
//!
//! A worker job is a loop that drains the run queue, falling back to the
//! deferred queue, running one unit at a time. Completing a unit moves one
//! deferred item back onto the run queue; a unit that hits a contended gate
//! goes (back) to the deferred queue. When no work remains the job
//! decrements the active count under the shared state lock and re-checks the
//! run queue once before really exiting, closing the submit/exit race.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::debug;

use crate::builder::{Shared, housekeep};
use crate::context::GraphBuildingContext;
use crate::resolver::RejectionReason;
use crate::task::{TaskId, UnitOutcome, force_exhaust, run_step};

/// Steps between housekeeping passes run opportunistically by workers.
const HOUSEKEEP_INTERVAL: u64 = 256;

/// Spawns detached jobs. Injected so tests and embedders control where
/// worker loops actually run.
pub trait JobExecutor: Send + Sync {
    fn spawn_job(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// The default executor: the global rayon pool.
#[derive(Debug, Default)]
pub struct RayonExecutor;

impl JobExecutor for RayonExecutor {
    fn spawn_job(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        rayon::spawn(job);
    }
}

/// An executor that spawns a dedicated thread per job. Useful when the
/// builder must not share the global pool.
#[derive(Debug, Default)]
pub struct ThreadExecutor;

impl JobExecutor for ThreadExecutor {
    fn spawn_job(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        std::thread::spawn(job);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Runs a single work unit: one task step wrapped in panic capture, followed
/// by the context merge and the deferred-queue bookkeeping.
pub(crate) fn run_unit(shared: &Shared, id: TaskId) -> UnitOutcome {
    let mut ctx = GraphBuildingContext::new();
    let outcome = match catch_unwind(AssertUnwindSafe(|| run_step(shared, &mut ctx, id))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            ctx.record_panic(&panic_message(payload.as_ref()));
            force_exhaust(
                shared,
                &mut ctx,
                id,
                RejectionReason::Fault("panicked during resolution".into()),
            );
            UnitOutcome::Completed
        }
    };
    match outcome {
        UnitOutcome::Completed => {
            // A finished unit may have released whatever a deferred task was
            // contending on; give one of them another chance.
            if let Some(parked) = shared.deferred.take_next() {
                shared.run_queue.push(parked);
            }
        }
        UnitOutcome::Deferred => {
            shared.deferred.push(id);
        }
    }
    ctx.steps += 1;
    ctx.merge_into(shared);
    outcome
}

/// The worker job body. `Shared::maybe_spawn` accounts for the job in
/// `active_jobs` before spawning it.
pub(crate) fn job_loop(shared: Arc<Shared>) {
    debug!("worker job starting");
    let mut deferral_streak: usize = 0;
    loop {
        if shared.is_cancelled() {
            break;
        }

        let (id, from_deferred) = match shared.run_queue.take_next() {
            Some(id) => (id, false),
            None => match shared.deferred.take_next() {
                Some(id) => (id, true),
                None => {
                    if shared.try_exit_worker() {
                        debug!("worker job exiting");
                        return;
                    }
                    continue;
                }
            },
        };

        let outcome = run_unit(&shared, id);

        if from_deferred && outcome == UnitOutcome::Deferred {
            deferral_streak += 1;
            // Everything left is contended; back off instead of spinning on
            // the gates.
            if deferral_streak >= shared.deferred.len().max(1) {
                std::thread::sleep(Duration::from_millis(1));
                deferral_streak = 0;
            }
        } else {
            deferral_streak = 0;
        }

        if shared.steps.load(Ordering::Relaxed) % HOUSEKEEP_INTERVAL == 0 {
            housekeep(&shared);
        }
    }

    // Cancelled: just drop out of the loop after deregistering.
    shared.deregister_worker();
    debug!("worker job cancelled");
}
