//! Critical regions
//!
//! Bookkeeping for the kernel's critical regions, which hold off normal
//! asynchronous procedure calls while a resource lock is held. The hosted
//! build has no APCs to defer, so a region here only records its nesting
//! depth per thread for [`critical_region_depth`] to report.

use std::cell::Cell;
use std::marker::PhantomData;

std::thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Current thread's critical region nesting depth
pub fn critical_region_depth() -> u32 {
    DEPTH.with(Cell::get)
}

/// Scope guard for a critical region. Leaving happens on drop.
///
/// Not `Send`: a region is entered and left on the same thread.
#[must_use = "the region is left as soon as the guard is dropped"]
pub struct CriticalRegion {
    _not_send: PhantomData<*const ()>,
}

impl CriticalRegion {
    /// Enter a critical region on the current thread
    pub fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _not_send: PhantomData }
    }
}

impl Drop for CriticalRegion {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regions_nest() {
        assert_eq!(critical_region_depth(), 0);
        let outer = CriticalRegion::enter();
        let inner = CriticalRegion::enter();
        assert_eq!(critical_region_depth(), 2);
        drop(inner);
        assert_eq!(critical_region_depth(), 1);
        drop(outer);
        assert_eq!(critical_region_depth(), 0);
    }

    #[test]
    fn test_depth_is_per_thread() {
        let _region = CriticalRegion::enter();
        let other = std::thread::spawn(critical_region_depth).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(critical_region_depth(), 1);
    }
}
