//! Generic call broadcast
//!
//! Runs a worker exactly once on every active logical processor and returns
//! once all of them have finished. Each processor gets its own high
//! importance DPC; completion is tracked by a shared counter the caller
//! spins on.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};

use super::dpc::{Dpc, DpcImportance};
use crate::core::cpu::ProcessorId;
use crate::core::mm::{AllocationError, PoolArray, PoolBox, PoolTag};
use crate::platform::Platform;
use crate::utils::cpu_relax;

/// Worker run on each processor with the caller's context
pub type BroadcastWorker<C> = fn(context: &C, processor: ProcessorId);

/// Broadcast failures. Only setup can fail; once dispatch starts the call
/// always runs to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BroadcastError {
    /// The completion counter or the per-processor records could not be
    /// allocated. No worker ran.
    #[error("generic call setup failed: {0}")]
    SetupAllocationFailure(AllocationError),
}

impl From<AllocationError> for BroadcastError {
    fn from(err: AllocationError) -> Self {
        BroadcastError::SetupAllocationFailure(err)
    }
}

/// Count of processors that have not finished their worker yet
#[derive(Debug)]
struct CompletionCounter(AtomicU32);

impl CompletionCounter {
    const fn new(processors: u32) -> Self {
        Self(AtomicU32::new(processors))
    }

    fn pending(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Mark one processor done. The counter's storage may be released as
    /// soon as this returns.
    fn complete_one(&self) {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "generic call completed more often than dispatched");
    }

    fn wait(&self) {
        while self.pending() != 0 {
            cpu_relax();
        }
    }
}

/// Per-processor dispatch record. `dpc` comes first so the DPC pointer the
/// routine receives is also the record's address.
#[repr(C)]
struct DispatchDescriptor<'a, P: ?Sized, C> {
    dpc: Dpc,
    target: ProcessorId,
    platform: &'a P,
    worker: BroadcastWorker<C>,
    context: &'a C,
    pending: &'a CompletionCounter,
}

unsafe fn dispatch_trampoline<P, C>(dpc: NonNull<Dpc>, _context: *mut (), _arg1: *mut (), _arg2: *mut ())
where
    P: Platform + ?Sized,
    C: Sync,
{
    // SAFETY: every DPC queued by `generic_call` is the first field of a
    // `DispatchDescriptor<P, C>` that lives until the counter reaches zero.
    let descriptor = unsafe { dpc.cast::<DispatchDescriptor<'_, P, C>>().as_ref() };

    let processor = descriptor.platform.current_processor_index();
    debug_assert_eq!(processor, descriptor.target, "generic call DPC ran off target");

    (descriptor.worker)(descriptor.context, processor);

    // Last touch of the descriptor: the caller frees it once all are done.
    descriptor.pending.complete_one();
}

/// Run `worker(context, processor)` once on every active processor and wait
/// for all of them.
///
/// The processor count is sampled once. Workers run concurrently on their
/// processors at dispatch level and must not block. The caller busy-waits
/// until the last one returns, so it must not itself run at dispatch level
/// on a processor it waits for.
///
/// Returns [`BroadcastError::SetupAllocationFailure`] without running any
/// worker if the dispatch records cannot be allocated.
pub fn generic_call<P, C>(platform: &P, worker: BroadcastWorker<C>, context: &C) -> Result<(), BroadcastError>
where
    P: Platform + ?Sized,
    C: Sync,
{
    let count = platform.processor_count();

    let pending = PoolBox::new(platform, PoolTag::GENERIC_CALL, CompletionCounter::new(count))
        .inspect_err(|e| log::warn!("Generic call: completion counter allocation failed: {}", e))?;

    let descriptors = PoolArray::from_fn(platform, PoolTag::GENERIC_CALL, count as usize, |i| {
        let target = ProcessorId(i as u32);
        let mut dpc = Dpc::new(dispatch_trampoline::<P, C>, ptr::null_mut());
        dpc.set_target_processor(target);
        dpc.set_importance(DpcImportance::High);

        DispatchDescriptor {
            dpc,
            target,
            platform,
            worker,
            context,
            pending: &*pending,
        }
    })
    .inspect_err(|e| log::warn!("Generic call: allocation of {} dispatch records failed: {}", count, e))?;

    tracef!("Generic call dispatching to {} processors", count);

    for index in 0..descriptors.len() {
        let Some(descriptor) = descriptors.element_ptr(index) else {
            break;
        };
        // SAFETY: `descriptors` and `pending` stay alive until `wait` below
        // has seen every routine finish.
        let queued = unsafe { platform.insert_queue_dpc(descriptor.cast::<Dpc>(), ptr::null_mut(), ptr::null_mut()) };
        if !queued {
            log::error!("Generic call: DPC for {} was refused", ProcessorId(index as u32));
        }
        debug_assert!(queued);
    }

    pending.wait();
    tracef!("Generic call completed on {} processors", count);
    Ok(())
}

fn call_closure<F: Fn(ProcessorId)>(f: &F, processor: ProcessorId) {
    f(processor)
}

/// Run `f` once on every active processor and wait for all of them.
///
/// Closure form of [`generic_call`].
pub fn broadcast<P, F>(platform: &P, f: F) -> Result<(), BroadcastError>
where
    P: Platform + ?Sized,
    F: Fn(ProcessorId) + Sync,
{
    generic_call(platform, call_closure::<F>, &f)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::core::cpu::ProcessorEnumerator;
    use crate::platform::hosted::HostedPlatform;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use test_case::test_case;

    struct Tally {
        hits: Vec<AtomicU32>,
    }

    impl Tally {
        fn new(processors: u32) -> Self {
            Self {
                hits: (0..processors).map(|_| AtomicU32::new(0)).collect(),
            }
        }

        fn counts(&self) -> Vec<u32> {
            self.hits.iter().map(|h| h.load(Ordering::SeqCst)).collect()
        }
    }

    fn record_hit(tally: &Tally, processor: ProcessorId) {
        tally.hits[processor.index()].fetch_add(1, Ordering::SeqCst);
    }

    #[test_case(1 ; "single processor")]
    #[test_case(2 ; "two processors")]
    #[test_case(4 ; "four processors")]
    #[test_case(8 ; "eight processors")]
    fn test_runs_once_per_processor(processors: u32) {
        let platform = HostedPlatform::new(processors).unwrap();
        let tally = Tally::new(processors);

        generic_call(&platform, record_hit, &tally).unwrap();

        assert_eq!(tally.counts(), vec![1; processors as usize]);
        for cpu in platform.processors() {
            assert_eq!(platform.dpcs_executed(cpu), 1);
        }
    }

    fn increment(counter: &AtomicU32, _processor: ProcessorId) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test_case(1 ; "uniprocessor still dispatches")]
    #[test_case(4 ; "quad processor")]
    fn test_shared_counter_reaches_processor_count(processors: u32) {
        let platform = HostedPlatform::new(processors).unwrap();
        let counter = AtomicU32::new(0);

        generic_call(&platform, increment, &counter).unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), processors);
        assert_eq!(platform.dpcs_executed(ProcessorId::BOOT), 1);
    }

    #[test]
    fn test_worker_sees_its_own_processor() {
        let platform = HostedPlatform::new(4).unwrap();
        let seen = Mutex::new(Vec::new());

        broadcast(&platform, |cpu| {
            assert_eq!(platform.current_processor_index(), cpu);
            seen.lock().unwrap().push(cpu.0);
        })
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_returns_after_all_workers() {
        let platform = HostedPlatform::new(4).unwrap();
        let results: Vec<AtomicU32> = (0..4).map(|_| AtomicU32::new(0)).collect();

        broadcast(&platform, |cpu| {
            std::thread::sleep(std::time::Duration::from_millis(5 * u64::from(cpu.0)));
            results[cpu.index()].store(cpu.0 * 10 + 1, Ordering::SeqCst);
        })
        .unwrap();

        let filled: Vec<u32> = results.iter().map(|r| r.load(Ordering::SeqCst)).collect();
        assert_eq!(filled, vec![1, 11, 21, 31]);
    }

    #[test]
    fn test_sequential_calls_are_independent() {
        let platform = HostedPlatform::new(3).unwrap();
        let first = Tally::new(3);
        let second = Tally::new(3);

        generic_call(&platform, record_hit, &first).unwrap();
        generic_call(&platform, record_hit, &second).unwrap();

        assert_eq!(first.counts(), vec![1, 1, 1]);
        assert_eq!(second.counts(), vec![1, 1, 1]);
        assert_eq!(platform.dpcs_executed(ProcessorId(2)), 2);
    }

    #[test]
    fn test_slow_first_call_leaves_second_untouched() {
        let platform = HostedPlatform::new(4).unwrap();
        let first = Tally::new(4);
        let second = Tally::new(4);

        broadcast(&platform, |cpu| {
            if cpu == ProcessorId(2) {
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            record_hit(&first, cpu);
        })
        .unwrap();
        generic_call(&platform, record_hit, &second).unwrap();

        assert_eq!(first.counts(), vec![1, 1, 1, 1]);
        assert_eq!(second.counts(), vec![1, 1, 1, 1]);
        for cpu in platform.processors() {
            assert_eq!(platform.dpcs_executed(cpu), 2);
        }
    }

    #[test]
    fn test_setup_memory_is_released() {
        let platform = HostedPlatform::new(4).unwrap();
        let before = platform.allocation_stats();

        broadcast(&platform, |_| {}).unwrap();

        let after = platform.allocation_stats();
        assert_eq!(after.total_allocations - before.total_allocations, 2);
        assert_eq!(after.total_deallocations - before.total_deallocations, 2);
        assert_eq!(after.current_usage, before.current_usage);
    }

    #[test_case(1 ; "counter allocation fails")]
    #[test_case(2 ; "descriptor allocation fails")]
    fn test_allocation_failure_runs_nothing(failing_allocation: usize) {
        let platform = HostedPlatform::new(4).unwrap();
        let invocations = AtomicUsize::new(0);

        if failing_allocation == 2 {
            // Let the counter through, fail the records.
            platform.fail_allocations_after(1, 1);
        } else {
            platform.inject_allocation_failures(1);
        }

        let result = broadcast(&platform, |_| {
            invocations.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(result, Err(BroadcastError::SetupAllocationFailure(AllocationError::OutOfMemory)));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(platform.allocation_stats().current_usage, 0);

        broadcast(&platform, |_| {
            invocations.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_counter_counts_down_to_zero() {
        let counter = CompletionCounter::new(4);
        for expected in (0..4).rev() {
            counter.complete_one();
            assert_eq!(counter.pending(), expected);
        }
        counter.wait();
    }

    #[test_case(2)]
    #[test_case(8)]
    #[test_case(32)]
    fn test_racing_completions_reach_zero(threads: u32) {
        let counter = CompletionCounter::new(threads);
        let start = std::sync::Barrier::new(threads as usize);

        std::thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    start.wait();
                    counter.complete_one();
                });
            }
        });

        assert_eq!(counter.pending(), 0);
        counter.wait();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "completed more often than dispatched")]
    fn test_extra_completion_is_caught() {
        let counter = CompletionCounter::new(1);
        counter.complete_one();
        counter.complete_one();
    }
}
