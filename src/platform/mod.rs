//! Host platform bindings
//!
//! The core reaches the host kernel only through the collaborator traits:
//! [`ProcessorEnumerator`], [`DeferredDispatch`] and [`PoolAllocator`]
//! (plus [`PhysicalMemory`] for translation). [`Platform`] bundles the ones
//! a generic call needs.

#[cfg(feature = "std")]
pub mod hosted;

use crate::core::cpu::ProcessorEnumerator;
use crate::core::mm::PoolAllocator;
use crate::core::smp::DeferredDispatch;

pub use crate::core::mm::PhysicalMemory;

/// Host services needed to broadcast work to every processor.
///
/// Shared between processors while a generic call is in flight, hence
/// `Sync`.
pub trait Platform: ProcessorEnumerator + DeferredDispatch + PoolAllocator + Sync {}

impl<T> Platform for T where T: ProcessorEnumerator + DeferredDispatch + PoolAllocator + Sync + ?Sized {}
