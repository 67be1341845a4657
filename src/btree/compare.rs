use std::cmp::Ordering;

/// Total order over keys. Every node of a tree is sorted by the comparator
/// the tree was opened with.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// memcmp over the common length, then the shorter key first.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorter_key_sorts_first_on_common_prefix() {
        let cmp = BytewiseComparator;
        assert_eq!(cmp.compare(b"abc", b"abcd"), Ordering::Less);
        assert_eq!(cmp.compare(b"abd", b"abcd"), Ordering::Greater);
        assert_eq!(cmp.compare(b"", b""), Ordering::Equal);
        assert_ne!(cmp.compare(b"ab", b"ab\0"), Ordering::Equal);
    }

    #[test]
    fn closures_are_comparators() {
        let reverse = |a: &[u8], b: &[u8]| b.cmp(a);
        assert_eq!(reverse.compare(b"a", b"b"), Ordering::Greater);
    }
}
