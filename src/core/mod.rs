//! Core platform services
//!
//! This module contains the services the hypervisor builds on:
//! processor enumeration, deferred dispatch and generic calls, memory
//! management, threads and synchronization.

pub mod cpu;
pub mod mm;
pub mod sched;
pub mod smp;
pub mod sync;

use crate::Result;

/// Initialize all core components
pub fn init() -> Result<()> {
    mm::init();
    sync::init();

    log::debug!("Core services initialized");
    Ok(())
}
