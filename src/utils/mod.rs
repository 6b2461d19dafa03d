//! Utility functions
//!
//! This module contains the logging channels, the sort helper and small
//! processor helpers used throughout the platform layer.

#[macro_use]
pub mod log;
pub mod sort;

pub use self::sort::qsort;

use num_traits::PrimInt;

/// Processor relax hint for spin-wait loops.
///
/// Lowers power use and contention on the sibling hardware thread while
/// polling. Purely an optimization.
#[inline(always)]
pub fn cpu_relax() {
    core::hint::spin_loop();
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub fn align_up<T: PrimInt>(value: T, align: T) -> T {
    let mask = align - T::one();
    (value + mask) & !mask
}

/// Round `value` down to a multiple of `align` (a power of two)
#[inline]
pub fn align_down<T: PrimInt>(value: T, align: T) -> T {
    value & !(align - T::one())
}

/// Check whether `value` is a multiple of `align` (a power of two)
#[inline]
pub fn is_aligned<T: PrimInt>(value: T, align: T) -> bool {
    value & (align - T::one()) == T::zero()
}
