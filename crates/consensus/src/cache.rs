//! Cache of gossip blocks awaiting checkpoint certification.
//!
//! Every validated block header lands here; when a checkpoint-bearing block
//! arrives, the cached range it certifies is cross-checked cid-by-cid and
//! flushed. A mismatch means a peer fed us a block the committee did not
//! finalize, and the checkpoint block is rejected.

use mir_types::{Checkpoint, Cid, Height};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("conflicting block at height {height}: cached {cached}, received {received}")]
    Conflict {
        height: Height,
        cached: Cid,
        received: Cid,
    },
    #[error("checkpoint lists {expected} for height {height} but cache holds {cached}")]
    CheckpointMismatch {
        height: Height,
        expected: Cid,
        cached: Cid,
    },
}

/// Blocks received via gossip that no checkpoint has certified yet.
///
/// Block validation runs on the host's tasks, so the map sits behind a
/// read-write lock.
#[derive(Default)]
pub struct BlockCache {
    blocks: RwLock<BTreeMap<Height, Cid>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received block. Two different blocks for the same height are
    /// a conflict: the cache keeps the first and rejects the second rather
    /// than letting a late arrival rewrite our view of the chain.
    pub fn receive_block(&self, height: Height, cid: Cid) -> Result<(), CacheError> {
        let mut blocks = self.blocks.write();
        match blocks.get(&height) {
            Some(cached) if *cached != cid => Err(CacheError::Conflict {
                height,
                cached: *cached,
                received: cid,
            }),
            _ => {
                blocks.insert(height, cid);
                Ok(())
            }
        }
    }

    /// Cross-check a received checkpoint against the cached range it covers
    /// (heights `parent.height ..= height - 1`, newest first in the cid
    /// list), then flush everything up to the checkpoint.
    ///
    /// Heights the cache never saw are skipped: a node that joined late may
    /// not hold the full range, and the checkpoint itself certifies them.
    pub fn receive_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CacheError> {
        let mut blocks = self.blocks.write();

        for (i, expected) in checkpoint.block_cids.iter().enumerate() {
            let height = Height(checkpoint.height.0 - 1 - i as u64);
            if let Some(cached) = blocks.get(&height) {
                if cached != expected {
                    return Err(CacheError::CheckpointMismatch {
                        height,
                        expected: *expected,
                        cached: *cached,
                    });
                }
            }
        }

        // The certified range (and anything older) is finalized; drop it.
        blocks.retain(|height, _| height.0 >= checkpoint.height.0);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mir_types::ParentMeta;

    fn checkpoint_over(parent_height: u64, height: u64) -> Checkpoint {
        Checkpoint {
            height: Height(height),
            parent: ParentMeta {
                height: Height(parent_height),
                cid: Cid::of(b"parent"),
            },
            // Newest first: height-1 down to parent_height.
            block_cids: (parent_height..height)
                .rev()
                .map(|h| Cid::of(&h.to_le_bytes()))
                .collect(),
        }
    }

    fn fill(cache: &BlockCache, range: std::ops::Range<u64>) {
        for h in range {
            cache
                .receive_block(Height(h), Cid::of(&h.to_le_bytes()))
                .unwrap();
        }
    }

    #[test]
    fn matching_checkpoint_flushes_range() {
        let cache = BlockCache::new();
        fill(&cache, 1..9);

        cache.receive_checkpoint(&checkpoint_over(1, 5)).unwrap();
        // Heights 1..=4 flushed, 5..=8 still pending certification.
        assert_eq!(cache.len(), 4);

        cache.receive_checkpoint(&checkpoint_over(5, 9)).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn mismatching_checkpoint_is_rejected() {
        let cache = BlockCache::new();
        fill(&cache, 1..5);
        cache.receive_block(Height(5), Cid::of(b"forged")).unwrap();

        let err = cache.receive_checkpoint(&checkpoint_over(1, 9)).unwrap_err();
        assert!(matches!(
            err,
            CacheError::CheckpointMismatch { height: Height(5), .. }
        ));
        // Nothing was flushed on rejection.
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn duplicate_block_is_idempotent_conflict_is_not() {
        let cache = BlockCache::new();
        let cid = Cid::of(b"the block");
        cache.receive_block(Height(3), cid).unwrap();
        cache.receive_block(Height(3), cid).unwrap();
        assert_eq!(cache.len(), 1);

        let err = cache
            .receive_block(Height(3), Cid::of(b"an impostor"))
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict { height: Height(3), .. }));
    }

    #[test]
    fn unseen_heights_are_skipped() {
        let cache = BlockCache::new();
        // Only height 3 cached out of the 1..=4 range.
        cache
            .receive_block(Height(3), Cid::of(&3u64.to_le_bytes()))
            .unwrap();
        cache.receive_checkpoint(&checkpoint_over(1, 5)).unwrap();
        assert!(cache.is_empty());
    }
}
