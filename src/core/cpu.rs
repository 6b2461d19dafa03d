//! Processor enumeration
//!
//! Logical processors are numbered densely from zero. The numbering is only
//! meaningful for the duration of a call; processor hot-add is not tracked.

use core::fmt;

/// Index of a logical processor, in `[0, processor_count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessorId(pub u32);

impl ProcessorId {
    /// The bootstrap processor
    pub const BOOT: ProcessorId = ProcessorId(0);

    /// Index as `usize`, for table lookups
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for ProcessorId {
    fn from(id: u32) -> Self {
        ProcessorId(id)
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CPU{}", self.0)
    }
}

/// Reports the active logical processors
pub trait ProcessorEnumerator {
    /// Number of active logical processors, at least one
    fn processor_count(&self) -> u32;

    /// Processor executing the caller.
    ///
    /// Only stable while the caller cannot migrate, e.g. inside a deferred
    /// procedure call.
    fn current_processor_index(&self) -> ProcessorId;

    /// Iterate over every active processor
    fn processors(&self) -> ProcessorIter {
        ProcessorIter {
            next: 0,
            count: self.processor_count(),
        }
    }
}

/// Iterator over processor indices
#[derive(Debug, Clone)]
pub struct ProcessorIter {
    next: u32,
    count: u32,
}

impl Iterator for ProcessorIter {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<ProcessorId> {
        if self.next < self.count {
            let id = ProcessorId(self.next);
            self.next += 1;
            Some(id)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.count - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ProcessorIter {}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTopology(u32);

    impl ProcessorEnumerator for FixedTopology {
        fn processor_count(&self) -> u32 {
            self.0
        }

        fn current_processor_index(&self) -> ProcessorId {
            ProcessorId::BOOT
        }
    }

    #[test]
    fn test_processor_iter() {
        let ids: std::vec::Vec<_> = FixedTopology(3).processors().collect();
        assert_eq!(ids, [ProcessorId(0), ProcessorId(1), ProcessorId(2)]);
        assert_eq!(FixedTopology(8).processors().len(), 8);
    }

    #[test]
    fn test_processor_display() {
        assert_eq!(std::format!("{}", ProcessorId(5)), "CPU5");
        assert_eq!(ProcessorId(5).index(), 5);
    }
}
