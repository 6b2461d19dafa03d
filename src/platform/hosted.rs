//! Hosted platform
//!
//! Simulates a multiprocessor host in user space. Every logical processor is
//! a dedicated OS thread draining its own DPC queue, pool memory comes from
//! the global allocator and physical addresses are identity mapped.

use std::alloc;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::config::XpfConfig;
use crate::core::cpu::{ProcessorEnumerator, ProcessorId};
use crate::core::mm::{
    AllocationError, AllocationRequest, AllocationStats, PhysAddr, PhysicalMemory, PoolAllocator, PoolTag, PoolType,
};
use crate::core::sched::ThreadError;
use crate::core::smp::{DeferredDispatch, Dpc};
use crate::core::sync::SpinLock;
use crate::{Error, Result};

std::thread_local! {
    static CURRENT_PROCESSOR: Cell<Option<ProcessorId>> = const { Cell::new(None) };
}

/// A DPC waiting in a processor queue
struct QueuedDpc(NonNull<Dpc>);

// SAFETY: `Dpc` is `Sync` and the inserter keeps it alive until it has run.
unsafe impl Send for QueuedDpc {}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedDpc>,
    shutdown: bool,
}

/// One simulated logical processor
struct Processor {
    id: ProcessorId,
    queue: Mutex<QueueState>,
    ready: Condvar,
    executed: AtomicU64,
}

impl Processor {
    fn new(id: ProcessorId) -> Self {
        Self {
            id,
            queue: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            executed: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, dpc: QueuedDpc, at_front: bool) {
        let mut state = self.state();
        if at_front {
            state.pending.push_front(dpc);
        } else {
            state.pending.push_back(dpc);
        }
        self.ready.notify_one();
    }

    fn shutdown(&self) {
        self.state().shutdown = true;
        self.ready.notify_all();
    }

    /// Next DPC to run, or `None` once shut down with an empty queue
    fn next_dpc(&self) -> Option<QueuedDpc> {
        let state = self.state();
        let mut state = self
            .ready
            .wait_while(state, |s| s.pending.is_empty() && !s.shutdown)
            .unwrap_or_else(PoisonError::into_inner);
        state.pending.pop_front()
    }

    fn run(self: Arc<Self>) {
        CURRENT_PROCESSOR.with(|current| current.set(Some(self.id)));
        log::trace!("{} online", self.id);

        while let Some(dpc) = self.next_dpc() {
            self.executed.fetch_add(1, Ordering::SeqCst);
            // SAFETY: claimed by `insert_queue_dpc` and kept alive by its inserter.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { Dpc::run(dpc.0) }));
            if outcome.is_err() {
                // A DPC routine failing at dispatch level takes the system down.
                panicf!("Deferred procedure call panicked on {}", self.id);
                process::abort();
            }
        }

        log::trace!("{} offline", self.id);
    }
}

/// Scripted allocation failures
#[derive(Debug, Default)]
struct FaultPlan {
    skip: usize,
    fail: usize,
}

impl FaultPlan {
    fn should_fail(&mut self) -> bool {
        if self.fail == 0 {
            return false;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        self.fail -= 1;
        true
    }
}

/// Pool allocator over the global allocator
#[derive(Default)]
struct HostAllocator {
    stats: SpinLock<AllocationStats>,
    faults: SpinLock<FaultPlan>,
}

impl HostAllocator {
    fn allocate(&self, request: &AllocationRequest) -> core::result::Result<NonNull<u8>, AllocationError> {
        let layout = request.effective_layout()?;

        if self.faults.lock().should_fail() {
            self.stats.lock().record_failure();
            log::debug!("Injected allocation failure: {} bytes tagged {:?}", layout.size(), request.tag);
            return Err(AllocationError::OutOfMemory);
        }

        // SAFETY: effective layouts never have a zero size.
        let Some(ptr) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            self.stats.lock().record_failure();
            return Err(AllocationError::OutOfMemory);
        };

        if let PoolType::Contiguous { highest } = request.pool {
            if ptr.as_ptr() as usize as PhysAddr + layout.size() as PhysAddr - 1 > highest {
                // SAFETY: allocated just above with the same layout.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                self.stats.lock().record_failure();
                return Err(AllocationError::OutOfMemory);
            }
        }

        self.stats.lock().record_allocation(layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, request: &AllocationRequest) {
        match request.effective_layout() {
            Ok(layout) => {
                // SAFETY: per the caller, `ptr` came from `allocate(request)`.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                self.stats.lock().record_deallocation(layout.size());
            }
            Err(e) => log::error!("Cannot free {:p}: request no longer valid: {}", ptr, e),
        }
    }
}

/// A multiprocessor host simulated with OS threads.
///
/// Dropping the platform drains every processor queue and joins the
/// processor threads.
pub struct HostedPlatform {
    processors: Vec<Arc<Processor>>,
    threads: Vec<JoinHandle<()>>,
    allocator: HostAllocator,
    mappings: AtomicUsize,
    nonpaged_tag: PoolTag,
    paged_tag: PoolTag,
}

impl HostedPlatform {
    /// Start a platform with `processor_count` logical processors
    pub fn new(processor_count: u32) -> Result<Self> {
        Self::with_config(&XpfConfig::with_processors(processor_count))
    }

    /// Start a platform as described by `config`.
    ///
    /// Without an explicit processor count one processor is simulated per
    /// available host thread.
    pub fn with_config(config: &XpfConfig) -> Result<Self> {
        let count = match config.processor_count {
            Some(count) => count,
            None => thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1),
        };
        if count == 0 {
            log::warn!("Hosted platform needs at least one processor");
            return Err(Error::InvalidArgument);
        }

        let mut platform = Self {
            processors: (0..count).map(|i| Arc::new(Processor::new(ProcessorId(i)))).collect(),
            threads: Vec::with_capacity(count as usize),
            allocator: HostAllocator::default(),
            mappings: AtomicUsize::new(0),
            nonpaged_tag: config.nonpaged_tag,
            paged_tag: config.paged_tag,
        };

        for index in 0..platform.processors.len() {
            let processor = Arc::clone(&platform.processors[index]);
            let id = processor.id;
            let handle = thread::Builder::new()
                .name(format!("xpf-cpu{}", id.0))
                .spawn(move || processor.run())
                .map_err(|e| {
                    log::error!("Failed to start {}: {}", id, e);
                    Error::Thread(ThreadError::CreationFailed)
                })?;
            platform.threads.push(handle);
        }

        dprintf!("Hosted platform started with {} processors", count);
        Ok(platform)
    }

    /// Number of DPCs `processor` has taken off its queue
    pub fn dpcs_executed(&self, processor: ProcessorId) -> u64 {
        self.processors
            .get(processor.index())
            .map_or(0, |p| p.executed.load(Ordering::SeqCst))
    }

    /// Pool allocation counters
    pub fn allocation_stats(&self) -> AllocationStats {
        *self.allocator.stats.lock()
    }

    /// Fail the next `count` pool allocations
    pub fn inject_allocation_failures(&self, count: usize) {
        self.fail_allocations_after(0, count);
    }

    /// Let `successes` pool allocations through, then fail the following
    /// `failures`
    pub fn fail_allocations_after(&self, successes: usize, failures: usize) {
        *self.allocator.faults.lock() = FaultPlan {
            skip: successes,
            fail: failures,
        };
    }

    /// Number of live physical mappings
    pub fn active_mappings(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }
}

impl Drop for HostedPlatform {
    fn drop(&mut self) {
        for processor in &self.processors {
            processor.shutdown();
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::error!("Processor thread terminated abnormally");
            }
        }
        log::debug!("Hosted platform with {} processors shut down", self.processors.len());
    }
}

impl ProcessorEnumerator for HostedPlatform {
    fn processor_count(&self) -> u32 {
        self.processors.len() as u32
    }

    /// Threads outside the platform report the boot processor.
    fn current_processor_index(&self) -> ProcessorId {
        CURRENT_PROCESSOR.with(Cell::get).unwrap_or(ProcessorId::BOOT)
    }
}

impl DeferredDispatch for HostedPlatform {
    unsafe fn insert_queue_dpc(&self, dpc: NonNull<Dpc>, arg1: *mut (), arg2: *mut ()) -> bool {
        let (target, at_front) = {
            // SAFETY: the caller keeps the DPC alive until it has run.
            let record = unsafe { dpc.as_ref() };
            let target = record
                .target_processor()
                .unwrap_or_else(|| self.current_processor_index());
            if target.index() >= self.processors.len() {
                log::error!("DPC targets {} but only {} processors exist", target, self.processors.len());
                return false;
            }
            if !record.claim(arg1, arg2) {
                return false;
            }
            (target, record.importance().queues_at_front())
        };

        self.processors[target.index()].enqueue(QueuedDpc(dpc), at_front);
        true
    }
}

impl PoolAllocator for HostedPlatform {
    fn allocate(&self, request: &AllocationRequest) -> core::result::Result<NonNull<u8>, AllocationError> {
        self.allocator.allocate(request)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, request: &AllocationRequest) {
        // SAFETY: forwarded from the caller.
        unsafe { self.allocator.deallocate(ptr, request) }
    }

    fn pool_tag(&self, pool: PoolType) -> PoolTag {
        match pool {
            PoolType::Paged => self.paged_tag,
            _ => self.nonpaged_tag,
        }
    }
}

fn identity_virtual(phys: PhysAddr) -> Option<NonNull<u8>> {
    usize::try_from(phys).ok().and_then(|addr| NonNull::new(addr as *mut u8))
}

impl PhysicalMemory for HostedPlatform {
    fn physical_address(&self, virt: *const u8) -> PhysAddr {
        virt as usize as PhysAddr
    }

    fn map_physical(&self, phys: PhysAddr, _len: usize) -> core::result::Result<NonNull<u8>, AllocationError> {
        let virt = identity_virtual(phys).ok_or(AllocationError::MappingFailed)?;
        self.mappings.fetch_add(1, Ordering::SeqCst);
        Ok(virt)
    }

    unsafe fn unmap_physical(&self, _virt: NonNull<u8>, _len: usize) {
        self.mappings.fetch_sub(1, Ordering::SeqCst);
    }

    fn find_virtual(&self, phys: PhysAddr) -> Option<NonNull<u8>> {
        identity_virtual(phys)
    }
}
