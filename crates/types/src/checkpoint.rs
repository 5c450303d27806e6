//! Application-level checkpoints.
//!
//! A checkpoint captures a finality point of the chain: all blocks from
//! `parent.height` through `height - 1` inclusive, most recent first. The
//! block at `parent.height` is included because the parent checkpoint
//! certified only up to `parent.height - 1`. The engine wraps this snapshot
//! in its own stable-checkpoint structure; this type is what the adapter
//! itself understands and indexes.

use crate::{Cid, Height};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference to the previous checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentMeta {
    pub height: Height,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint height; the newest certified block sits at `height - 1`.
    pub height: Height,
    pub parent: ParentMeta,
    /// Block cids for heights `parent.height ..= height - 1`, ordered from
    /// most recent to oldest.
    pub block_cids: Vec<Cid>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("encoding checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decoding checkpoint: {0}")]
    Decode(#[source] serde_json::Error),
    #[error(
        "checkpoint covers {covered} heights but carries {cids} block cids",
    )]
    WrongSpan { covered: u64, cids: usize },
}

impl Checkpoint {
    /// Synthetic genesis checkpoint: the genesis block is taken as verified,
    /// so the first real checkpoint starts at height 1.
    pub fn genesis(genesis_block: Cid) -> Self {
        Checkpoint {
            height: Height(1),
            parent: ParentMeta {
                height: Height(0),
                cid: genesis_block,
            },
            block_cids: Vec::new(),
        }
    }

    /// Number of heights this checkpoint certifies.
    pub fn span(&self) -> u64 {
        self.height.0.saturating_sub(self.parent.height.0)
    }

    /// Check the block-cid list matches the covered height range.
    /// The genesis checkpoint is exempt: it certifies nothing yet.
    pub fn validate_shape(&self) -> Result<(), CheckpointError> {
        if self.block_cids.is_empty() && self.parent.height == Height(0) {
            return Ok(());
        }
        if self.block_cids.len() as u64 != self.span() {
            return Err(CheckpointError::WrongSpan {
                covered: self.span(),
                cids: self.block_cids.len(),
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        serde_json::to_vec(self).map_err(CheckpointError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        serde_json::from_slice(bytes).map_err(CheckpointError::Decode)
    }

    /// Deterministic content hash of the checkpoint.
    pub fn cid(&self) -> Result<Cid, CheckpointError> {
        Ok(Cid::of(&self.to_bytes()?))
    }

    pub fn parent_meta(&self) -> Result<ParentMeta, CheckpointError> {
        Ok(ParentMeta {
            height: self.height,
            cid: self.cid()?,
        })
    }
}
