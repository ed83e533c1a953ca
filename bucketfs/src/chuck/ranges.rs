//! Disjoint half-open byte ranges, merged on insert.

use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> end, never overlapping or touching
    map: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of all range lengths.
    pub fn total_len(&self) -> u64 {
        self.map.iter().map(|(s, e)| e - s).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<u64>> + '_ {
        self.map.iter().map(|(&s, &e)| s..e)
    }

    pub fn insert(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let mut start = range.start;
        let mut end = range.end;

        // left neighbour that overlaps or touches
        if let Some((&s, &e)) = self.map.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.map.remove(&s);
            }
        }
        // everything starting inside [start, end]
        let absorbed: Vec<u64> = self.map.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.map.remove(&s) {
                end = end.max(e);
            }
        }
        self.map.insert(start, end);
    }

    /// Whether `range` is fully covered.
    pub fn contains(&self, range: &Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        self.map
            .range(..=range.start)
            .next_back()
            .is_some_and(|(_, &e)| e >= range.end)
    }

    /// Parts of `range` not covered, in order.
    pub fn missing(&self, range: &Range<u64>) -> Vec<Range<u64>> {
        let mut out = Vec::new();
        let mut cursor = range.start;
        if let Some((_, &e)) = self.map.range(..=range.start).next_back() {
            cursor = cursor.max(e);
        }
        for (&s, &e) in self.map.range(range.start..range.end) {
            if s > cursor {
                out.push(cursor..s);
            }
            cursor = cursor.max(e);
        }
        if cursor < range.end {
            out.push(cursor..range.end);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_adjacent_and_overlapping() {
        let mut set = RangeSet::new();
        set.insert(0..10);
        set.insert(20..30);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..10, 20..30]);
        set.insert(10..20);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..30]);
        set.insert(25..40);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..40]);
        assert_eq!(set.total_len(), 40);
    }

    #[test]
    fn test_contains_and_missing() {
        let mut set = RangeSet::new();
        set.insert(10..20);
        set.insert(30..40);
        assert!(set.contains(&(12..18)));
        assert!(!set.contains(&(15..35)));
        assert_eq!(set.missing(&(0..50)), vec![0..10, 20..30, 40..50]);
        assert_eq!(set.missing(&(15..32)), vec![20..30]);
        assert!(set.missing(&(30..40)).is_empty());
    }

    #[test]
    fn test_empty_range_is_ignored() {
        let mut set = RangeSet::new();
        set.insert(5..5);
        assert!(set.is_empty());
        assert!(set.contains(&(3..3)));
    }
}
