//! # Comparators
//!
//! Key order is total and determined by the comparator installed on the
//! database handle. There are no process-global comparator tables; the
//! registry is an explicit field of the handle, installed at open/create
//! and replaceable afterwards.
//!
//! The optional prefix comparator is a short-circuit: it sees only the
//! inline prefix of an extended key plus the full lengths, and either
//! decides the ordering or signals that the full key must be materialised
//! for the real comparator.

use std::cmp::Ordering;

/// Full-key comparator.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// What a prefix comparator concluded from the available bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOutcome {
    Decided(Ordering),
    /// The prefix was not enough; consult the full comparator. Never
    /// surfaced to callers.
    RequestFullKey,
}

/// Prefix comparator: gets the available bytes of each key and the full
/// lengths they were cut from.
pub type PrefixCompareFn = fn(&[u8], usize, &[u8], usize) -> PrefixOutcome;

/// Unsigned byte-wise lexicographic order; a shared prefix is broken by
/// length. This is slice `Ord` on `[u8]`.
pub fn default_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

#[derive(Clone, Copy)]
pub struct Comparators {
    pub compare: CompareFn,
    pub prefix_compare: Option<PrefixCompareFn>,
}

impl Default for Comparators {
    fn default() -> Self {
        Self {
            compare: default_compare,
            prefix_compare: None,
        }
    }
}

impl std::fmt::Debug for Comparators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comparators")
            .field("prefix_compare", &self.prefix_compare.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_compare_is_lexicographic() {
        assert_eq!(default_compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(default_compare(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(default_compare(b"b", b"a"), Ordering::Greater);
    }

    #[test]
    fn shared_prefix_breaks_by_length() {
        assert_eq!(default_compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(default_compare(b"abc", b"ab"), Ordering::Greater);
    }

    #[test]
    fn unsigned_comparison_of_high_bytes() {
        assert_eq!(default_compare(&[0x7F], &[0x80]), Ordering::Less);
        assert_eq!(default_compare(&[0xFF], &[0x00]), Ordering::Greater);
    }
}
