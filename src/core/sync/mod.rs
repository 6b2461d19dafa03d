//! Synchronization primitives
//!
//! This module provides synchronization primitives suitable for
//! use in the hypervisor kernel environment.

pub mod spinlock;

#[cfg(feature = "std")]
pub mod critical;
#[cfg(feature = "std")]
pub mod reslock;

// Re-export SpinLock for convenience
pub use spinlock::SpinLock;

#[cfg(feature = "std")]
pub use self::{
    critical::{critical_region_depth, CriticalRegion},
    reslock::{ExclusiveGuard, ResourceLock, SharedGuard},
};

/// Initialize synchronization subsystem
pub fn init() {
    log::trace!("Synchronization primitives ready");
}
