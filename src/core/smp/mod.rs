//! Multiprocessor services
//!
//! Deferred procedure calls and the generic call broadcast built on them.

pub mod broadcast;
pub mod dpc;

pub use broadcast::{broadcast, generic_call, BroadcastError, BroadcastWorker};
pub use dpc::{DeferredDispatch, DeferredRoutine, Dpc, DpcImportance};
