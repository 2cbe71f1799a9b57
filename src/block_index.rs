//! In-memory `BlockId -> BlockLocation` map.
//!
//! One writer, many readers: the index is updated exactly once per
//! successful append, after the bytes have fully reached the OS. Lookups
//! never block a write already in flight because the lock is only held
//! for the duration of the map mutation/read, never across I/O.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

/// In-memory location of a block within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub position: u64,
    pub length: u64,
    pub block_id: i64,
}

#[derive(Error, Debug)]
pub enum BlockIndexError {
    #[error("no block with id {0} in the index")]
    BlockNotFound(i64),
}

#[derive(Default)]
struct Inner {
    map: HashMap<i64, BlockLocation>,
    live_block_count: usize,
    superseded_bytes: u64,
}

/// `RwLock`-guarded `BlockId -> BlockLocation` map with latest-write-wins
/// semantics. Secondary counters are advisory only (compaction triggers),
/// per spec — they carry no correctness obligation.
pub struct BlockIndex {
    inner: RwLock<Inner>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Record a location for `block_id`, replacing any existing entry.
    /// Used both by `Scanner` (during rebuild) and by `BlockFile::append`
    /// (after a successful write).
    pub fn record(&self, location: BlockLocation) {
        let mut inner = self.inner.write().expect("block index poisoned");
        if let Some(prev) = inner.map.insert(location.block_id, location) {
            inner.superseded_bytes += prev.length;
        } else {
            inner.live_block_count += 1;
        }
    }

    pub fn lookup(&self, block_id: i64) -> Result<BlockLocation, BlockIndexError> {
        let inner = self.inner.read().expect("block index poisoned");
        inner
            .map
            .get(&block_id)
            .copied()
            .ok_or(BlockIndexError::BlockNotFound(block_id))
    }

    pub fn contains(&self, block_id: i64) -> bool {
        let inner = self.inner.read().expect("block index poisoned");
        inner.map.contains_key(&block_id)
    }

    /// Number of distinct ids currently mapped (the live set size).
    pub fn live_block_count(&self) -> usize {
        self.inner.read().expect("block index poisoned").live_block_count
    }

    /// Sum of lengths of superseded locations observed so far. Advisory
    /// only; drives compaction heuristics, has no correctness role.
    pub fn superseded_bytes(&self) -> u64 {
        self.inner.read().expect("block index poisoned").superseded_bytes
    }

    /// Snapshot of every live `(BlockId, BlockLocation)` pair, in no
    /// particular order.
    pub fn snapshot(&self) -> Vec<BlockLocation> {
        let inner = self.inner.read().expect("block index poisoned");
        inner.map.values().copied().collect()
    }

    /// Replace the entire index contents, e.g. after a from-scratch
    /// `Scanner` rebuild. Resets the superseded-bytes counter since a
    /// scan only ever reports the live set's final locations (superseded
    /// bytes along the way are tracked internally by the scan loop and
    /// passed in separately if needed).
    pub fn replace_all(&self, locations: impl IntoIterator<Item = BlockLocation>) {
        let mut inner = self.inner.write().expect("block index poisoned");
        inner.map.clear();
        inner.live_block_count = 0;
        inner.superseded_bytes = 0;
        for loc in locations {
            if inner.map.insert(loc.block_id, loc).is_none() {
                inner.live_block_count += 1;
            }
        }
    }
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(id: i64, pos: u64, len: u64) -> BlockLocation {
        BlockLocation {
            position: pos,
            length: len,
            block_id: id,
        }
    }

    #[test]
    fn latest_write_wins() {
        let idx = BlockIndex::new();
        idx.record(loc(1001, 0, 10));
        idx.record(loc(1001, 100, 20));
        let found = idx.lookup(1001).unwrap();
        assert_eq!(found.position, 100);
        assert_eq!(idx.live_block_count(), 1);
        assert_eq!(idx.superseded_bytes(), 10);
    }

    #[test]
    fn lookup_miss_is_block_not_found() {
        let idx = BlockIndex::new();
        assert!(matches!(
            idx.lookup(404),
            Err(BlockIndexError::BlockNotFound(404))
        ));
    }

    #[test]
    fn distinct_ids_tracked_independently() {
        let idx = BlockIndex::new();
        for i in 0..10 {
            idx.record(loc(1000 + i, i as u64 * 64, 64));
        }
        assert_eq!(idx.live_block_count(), 10);
        for i in 0..10 {
            assert_eq!(idx.lookup(1000 + i).unwrap().block_id, 1000 + i);
        }
    }

    #[test]
    fn replace_all_rebuilds_from_scratch() {
        let idx = BlockIndex::new();
        idx.record(loc(1, 0, 5));
        idx.record(loc(2, 5, 5));
        idx.replace_all(vec![loc(2, 5, 5), loc(3, 10, 5)]);
        assert_eq!(idx.live_block_count(), 2);
        assert!(idx.lookup(1).is_err());
        assert!(idx.lookup(3).is_ok());
    }
}
