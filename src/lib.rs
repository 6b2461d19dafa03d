//! XPF-Core - platform primitives for a kernel-resident hypervisor
//!
//! This crate provides the system services a hypervisor driver layers its
//! virtualization logic on top of:
//! - Debug logging through prefixed channels
//! - Pool, contiguous and large-page memory allocation
//! - Physical address translation and mapping
//! - Thread create/exit/join/alert and alertable sleep
//! - Reader/writer resource locks
//! - Generic calls: running a function on every logical processor and
//!   waiting for all of them to finish
//!
//! The core is `no_std`. With the `std` feature (on by default) a hosted
//! platform simulates logical processors with dedicated OS threads.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

extern crate alloc;

// Core modules
#[macro_use]
pub mod utils;
pub mod config;

// Core services
pub mod core;

// Host platform bindings
pub mod platform;

pub use crate::config::XpfConfig;
pub use crate::core::cpu::{ProcessorEnumerator, ProcessorId};
pub use crate::core::smp::{broadcast, generic_call, BroadcastError, BroadcastWorker};
pub use crate::platform::Platform;

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        pub use crate::platform::hosted::HostedPlatform;
    }
}

/// XPF-Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the platform layer.
///
/// Installs the debug logger with the level from `config`. Calling it more
/// than once keeps the first logger.
pub fn init(config: &XpfConfig) -> Result<()> {
    utils::log::init(config.log_level)?;
    crate::core::init()?;

    driver_print!("XPF-Core v{} initialized", VERSION);
    Ok(())
}

/// Common error type for XPF-Core
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// Logger could not be installed
    #[error("a different logger is already installed")]
    LoggerInstalled,
    /// Memory management error
    #[error(transparent)]
    Allocation(#[from] crate::core::mm::AllocationError),
    /// Generic call error
    #[error(transparent)]
    Broadcast(#[from] crate::core::smp::BroadcastError),
    /// Thread error
    #[error(transparent)]
    Thread(#[from] crate::core::sched::ThreadError),
}

/// Result type for XPF-Core
pub type Result<T> = ::core::result::Result<T, Error>;
