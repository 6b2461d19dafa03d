//! Deferred procedure calls
//!
//! A [`Dpc`] is a caller-owned record naming a routine to run at dispatch
//! level on a chosen processor. The platform's [`DeferredDispatch`] queues
//! it; the record must stay put until its routine has started.

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::core::cpu::ProcessorId;

/// Routine run for a queued [`Dpc`].
///
/// Receives the DPC itself, the context given at initialization and the two
/// arguments given at insertion.
pub type DeferredRoutine = unsafe fn(dpc: NonNull<Dpc>, deferred_context: *mut (), arg1: *mut (), arg2: *mut ());

/// Queue placement of a [`Dpc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum DpcImportance {
    /// Queued at the tail, target not interrupted
    Low,
    /// Queued at the tail
    #[default]
    Medium,
    /// Queued at the head
    High,
}

impl DpcImportance {
    /// Whether DPCs of this importance go to the front of the queue
    pub const fn queues_at_front(self) -> bool {
        matches!(self, DpcImportance::High)
    }
}

/// Deferred procedure call record
pub struct Dpc {
    routine: DeferredRoutine,
    deferred_context: *mut (),
    target: Option<ProcessorId>,
    importance: DpcImportance,
    queued: AtomicBool,
    arguments: UnsafeCell<(*mut (), *mut ())>,
}

// SAFETY: the routine and context are fixed while queued. `arguments` is only
// written by whoever won the `queued` flag and read by the processor running
// the DPC after it was handed over through the queue.
unsafe impl Send for Dpc {}
unsafe impl Sync for Dpc {}

impl Dpc {
    /// Initialize a DPC for `routine`. Runs on the inserting processor
    /// with medium importance until told otherwise.
    pub const fn new(routine: DeferredRoutine, deferred_context: *mut ()) -> Self {
        Self {
            routine,
            deferred_context,
            target: None,
            importance: DpcImportance::Medium,
            queued: AtomicBool::new(false),
            arguments: UnsafeCell::new((ptr::null_mut(), ptr::null_mut())),
        }
    }

    /// Bind the DPC to `processor`
    pub fn set_target_processor(&mut self, processor: ProcessorId) {
        self.target = Some(processor);
    }

    /// Set the queue placement
    pub fn set_importance(&mut self, importance: DpcImportance) {
        self.importance = importance;
    }

    /// Replace the context handed to the routine
    pub fn set_deferred_context(&mut self, deferred_context: *mut ()) {
        self.deferred_context = deferred_context;
    }

    pub fn target_processor(&self) -> Option<ProcessorId> {
        self.target
    }

    pub fn importance(&self) -> DpcImportance {
        self.importance
    }

    pub fn deferred_context(&self) -> *mut () {
        self.deferred_context
    }

    /// Whether the DPC sits in a queue and has not started yet
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Claim the DPC for queuing with the given arguments.
    ///
    /// Returns `false` if it is already queued; the arguments are then
    /// left untouched.
    pub fn claim(&self, arg1: *mut (), arg2: *mut ()) -> bool {
        if self
            .queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // SAFETY: winning the flag grants sole access to the arguments until
        // the DPC runs.
        unsafe { *self.arguments.get() = (arg1, arg2) };
        true
    }

    /// Run a claimed DPC on the current processor.
    ///
    /// The DPC is released before the routine is entered, so the routine may
    /// requeue it or free its storage.
    ///
    /// # Safety
    /// `this` must point to a live DPC that was claimed and handed to the
    /// calling processor. The routine's own contract must hold.
    pub unsafe fn run(this: NonNull<Dpc>) {
        let (routine, context, (arg1, arg2)) = {
            // SAFETY: live per the caller's contract.
            let dpc = unsafe { this.as_ref() };
            // SAFETY: the claimant's write happened before the hand-over.
            let arguments = unsafe { *dpc.arguments.get() };
            (dpc.routine, dpc.deferred_context, arguments)
        };

        // SAFETY: as above; nothing touches the record after this store.
        unsafe { this.as_ref() }.queued.store(false, Ordering::Release);
        // SAFETY: forwarded from the caller.
        unsafe { routine(this, context, arg1, arg2) };
    }
}

impl fmt::Debug for Dpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dpc")
            .field("target", &self.target)
            .field("importance", &self.importance)
            .field("queued", &self.is_queued())
            .finish_non_exhaustive()
    }
}

/// Queues DPCs onto processors
pub trait DeferredDispatch {
    /// Queue `dpc` on its target processor, or on the current processor if
    /// it has none, passing `arg1` and `arg2` to its routine.
    ///
    /// Returns `false` without queuing if the DPC is already queued. A fresh
    /// DPC targeted at an active processor is always accepted.
    ///
    /// # Safety
    /// `dpc` must stay valid and unmoved until its routine has been entered,
    /// and everything the routine dereferences must outlive that run.
    unsafe fn insert_queue_dpc(&self, dpc: NonNull<Dpc>, arg1: *mut (), arg2: *mut ()) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    unsafe fn count_runs(dpc: NonNull<Dpc>, context: *mut (), arg1: *mut (), _arg2: *mut ()) {
        // SAFETY: tests pass an `AtomicUsize` as the context.
        let runs = unsafe { &*context.cast::<AtomicUsize>() };
        runs.fetch_add(arg1 as usize, Ordering::SeqCst);
        // SAFETY: the DPC outlives the test body.
        assert!(!unsafe { dpc.as_ref() }.is_queued());
    }

    #[test]
    fn test_defaults() {
        let dpc = Dpc::new(count_runs, ptr::null_mut());
        assert_eq!(dpc.target_processor(), None);
        assert_eq!(dpc.importance(), DpcImportance::Medium);
        assert!(!dpc.is_queued());
    }

    #[test]
    fn test_claim_rejects_requeue() {
        let dpc = Dpc::new(count_runs, ptr::null_mut());
        assert!(dpc.claim(ptr::null_mut(), ptr::null_mut()));
        assert!(!dpc.claim(ptr::null_mut(), ptr::null_mut()));
        assert!(dpc.is_queued());
    }

    #[test]
    fn test_run_releases_and_passes_arguments() {
        let runs = AtomicUsize::new(0);
        let mut dpc = Dpc::new(count_runs, ptr::null_mut());
        dpc.set_deferred_context((&runs as *const AtomicUsize).cast_mut().cast());
        dpc.set_target_processor(ProcessorId(3));
        dpc.set_importance(DpcImportance::High);

        assert!(dpc.claim(5usize as *mut (), ptr::null_mut()));
        // SAFETY: claimed above and still in scope.
        unsafe { Dpc::run(NonNull::from(&dpc)) };

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert!(!dpc.is_queued());
        assert!(dpc.claim(ptr::null_mut(), ptr::null_mut()));
    }

    #[test]
    fn test_importance_placement() {
        assert!(DpcImportance::High.queues_at_front());
        assert!(!DpcImportance::Medium.queues_at_front());
        assert!(!DpcImportance::Low.queues_at_front());
    }
}
