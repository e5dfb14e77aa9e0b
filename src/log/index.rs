/// A recorded sample: the frame for `index` starts at byte `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub index: u64,
    pub offset: u64,
}

/// Sparse mapping from log indices to byte offsets within one segment.
///
/// The writer records a sample for every `granularity`-th index (the first
/// entry of a segment is always recorded), bounding memory at one `Position`
/// per `granularity` entries. Lookups return the nearest recorded position
/// at or below the requested index; the reader scans forward from there.
///
/// The index never diverges from segment content: it is truncated in
/// lockstep with the segment and rebuilt by a full scan on recovery.
#[derive(Debug)]
pub struct SparseIndex {
    granularity: u64,
    positions: Vec<Position>,
}

impl SparseIndex {
    pub fn new(granularity: u64) -> Self {
        assert!(granularity >= 1, "index granularity must be at least 1");
        Self {
            granularity,
            positions: Vec::new(),
        }
    }

    /// Records a sample for `index` if it falls on the sampling grid.
    ///
    /// Recording the same index twice with a different offset would mean the
    /// index and the data disagree; that is a corruption bug, not a state
    /// this structure repairs.
    pub fn record(&mut self, index: u64, offset: u64) {
        if let Some(last) = self.positions.last() {
            if index <= last.index {
                debug_assert_eq!(
                    (index, offset),
                    (last.index, last.offset),
                    "sparse index must only grow"
                );
                return;
            }
        }
        if self.positions.is_empty() || index % self.granularity == 0 {
            self.positions.push(Position { index, offset });
        }
    }

    /// Greatest recorded position with `position.index <= index`, if any.
    pub fn lookup(&self, index: u64) -> Option<Position> {
        match self.positions.binary_search_by_key(&index, |p| p.index) {
            Ok(i) => Some(self.positions[i]),
            Err(0) => None,
            Err(i) => Some(self.positions[i - 1]),
        }
    }

    /// Drops all recorded positions with `position.index >= index`.
    pub fn truncate(&mut self, index: u64) {
        let keep = self.positions.partition_point(|p| p.index < index);
        self.positions.truncate(keep);
    }

    pub fn last(&self) -> Option<Position> {
        self.positions.last().copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_empty() {
        let index = SparseIndex::new(4);
        assert_eq!(index.lookup(10), None);
    }

    #[test]
    fn test_first_entry_always_recorded() {
        let mut index = SparseIndex::new(10);
        index.record(3, 0);
        assert_eq!(index.lookup(3), Some(Position { index: 3, offset: 0 }));
        assert_eq!(index.lookup(9), Some(Position { index: 3, offset: 0 }));
    }

    #[test]
    fn test_sampled_recording() {
        let mut index = SparseIndex::new(4);
        for i in 1..=20u64 {
            index.record(i, i * 100);
        }
        // First entry plus every multiple of four.
        assert_eq!(index.len(), 6);
        assert_eq!(index.lookup(1), Some(Position { index: 1, offset: 100 }));
        assert_eq!(index.lookup(7), Some(Position { index: 4, offset: 400 }));
        assert_eq!(
            index.lookup(999),
            Some(Position {
                index: 20,
                offset: 2000
            })
        );
    }

    #[test]
    fn test_lookup_below_first_recorded() {
        let mut index = SparseIndex::new(4);
        index.record(8, 800);
        assert_eq!(index.lookup(7), None);
    }

    #[test]
    fn test_truncate_drops_at_and_after() {
        let mut index = SparseIndex::new(1);
        for i in 1..=10u64 {
            index.record(i, i * 10);
        }
        index.truncate(6);
        assert_eq!(index.last(), Some(Position { index: 5, offset: 50 }));
        assert_eq!(index.lookup(9), Some(Position { index: 5, offset: 50 }));

        index.truncate(1);
        assert!(index.is_empty());
    }

    #[test]
    fn test_duplicate_record_is_ignored() {
        let mut index = SparseIndex::new(1);
        index.record(1, 0);
        index.record(1, 0);
        assert_eq!(index.len(), 1);
    }
}
