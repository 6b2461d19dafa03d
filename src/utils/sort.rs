//! Sorting helper
//!
//! In-place sort with a caller-provided comparator, used for ordering
//! tables such as memory ranges or MSR lists.

use core::cmp::Ordering;

/// Sort `items` in place using `comparator`.
///
/// The sort is unstable: equal elements may be reordered.
pub fn qsort<T, F>(items: &mut [T], comparator: F)
where
    F: FnMut(&T, &T) -> Ordering,
{
    items.sort_unstable_by(comparator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qsort_ascending() {
        let mut ranges = [0x3000u64, 0x1000, 0x4000, 0x2000];
        qsort(&mut ranges, |a, b| a.cmp(b));
        assert_eq!(ranges, [0x1000, 0x2000, 0x3000, 0x4000]);
    }

    #[test]
    fn test_qsort_by_key_descending() {
        let mut entries = [(1u32, 'a'), (7, 'b'), (3, 'c')];
        qsort(&mut entries, |a, b| b.0.cmp(&a.0));
        assert_eq!(entries, [(7, 'b'), (3, 'c'), (1, 'a')]);
    }

    #[test]
    fn test_qsort_empty() {
        let mut empty: [u8; 0] = [];
        qsort(&mut empty, |a, b| a.cmp(b));
        assert!(empty.is_empty());
    }
}
