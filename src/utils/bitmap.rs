//! Fixed-size vote bitmap over configured node positions.

use std::fmt;

use fixedbitset::FixedBitSet;

use serde::{Deserialize, Serialize};

/// One bit per configured node; bit `i` is the node at position `i` of the
/// network config's node list, not node ID `i`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// All-clear bitmap covering `size` nodes.
    pub fn new(size: usize) -> Self {
        Bitmap(FixedBitSet::with_capacity(size))
    }

    /// Records a vote at `idx`, growing the bitmap if `idx` lies past its
    /// end. Returns true if the bit was not set before.
    pub fn insert(&mut self, idx: usize) -> bool {
        if idx >= self.0.len() {
            self.0.grow(idx + 1);
        }
        !self.0.put(idx)
    }

    /// Number of node positions covered.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    /// Number of votes recorded.
    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// Positions that voted, ascending.
    #[inline]
    pub fn voters(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.ones()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let voters: Vec<usize> = self.voters().collect();
        write!(f, "{}/{}{:?}", self.count(), self.size(), voters)
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn votes_counted_once() {
        let mut map = Bitmap::new(4);
        assert!(map.insert(2));
        assert!(!map.insert(2));
        assert!(map.insert(0));
        assert_eq!(map.count(), 2);
        assert_eq!(map.voters().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn insert_past_end_grows() {
        let mut map = Bitmap::new(4);
        assert!(map.insert(6));
        assert_eq!(map.size(), 7);
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn debug_lists_voters() {
        let mut map = Bitmap::new(4);
        map.insert(1);
        map.insert(3);
        assert_eq!(format!("{:?}", map), "2/4[1, 3]");
    }
}
