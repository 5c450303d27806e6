//! Typed wrapper over the metadata store for checkpoints.
//!
//! Keyspace:
//! - `mir/checkpoints/latest`         → application snapshot bytes
//! - `mir/checkpoints/latest-pb`      → stable-checkpoint serialization
//! - `mir/checkpoints/height/<h>`     → stable-checkpoint serialization
//! - `mir/checkpoints/cid/<cid>`      → application snapshot bytes
//!
//! The four records of one checkpoint are written in that fixed order, so a
//! crash in the middle leaves at worst a stale index entry and never a
//! missing `latest`.

use crate::db::MetadataStore;
use crate::error::Error;
use mir_smr::StableCheckpoint;
use mir_types::{Checkpoint, Cid, Height, ParentMeta};
use std::sync::Arc;

pub const CHECKPOINT_KEY_PREFIX: &str = "mir/checkpoints/";
const LATEST_KEY: &str = "mir/checkpoints/latest";
const LATEST_PB_KEY: &str = "mir/checkpoints/latest-pb";

fn height_index_key(height: Height) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}height/{height}")
}

fn cid_index_key(cid: &Cid) -> String {
    format!("{CHECKPOINT_KEY_PREFIX}cid/{cid}")
}

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn MetadataStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        CheckpointStore { store }
    }

    /// Latest persisted application snapshot, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>, Error> {
        match self.store.get(LATEST_KEY)? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Latest snapshot, or the synthetic genesis checkpoint when the node
    /// starts from scratch.
    pub fn latest_or_genesis(&self, genesis_block: Cid) -> Result<Checkpoint, Error> {
        Ok(self
            .latest()?
            .unwrap_or_else(|| Checkpoint::genesis(genesis_block)))
    }

    /// Latest full stable checkpoint, if any.
    pub fn latest_stable(&self) -> Result<Option<StableCheckpoint>, Error> {
        match self.store.get(LATEST_PB_KEY)? {
            Some(bytes) => Ok(Some(StableCheckpoint::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stable checkpoint indexed by the snapshot height. Useful for
    /// catastrophic recoveries that restart the network from a specific
    /// point.
    pub fn by_height(&self, height: Height) -> Result<Option<StableCheckpoint>, Error> {
        match self.store.get(&height_index_key(height))? {
            Some(bytes) => Ok(Some(StableCheckpoint::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Application snapshot indexed by its content hash.
    pub fn by_cid(&self, cid: &Cid) -> Result<Option<Checkpoint>, Error> {
        match self.store.get(&cid_index_key(cid))? {
            Some(bytes) => Ok(Some(Checkpoint::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist one agreed checkpoint: the two `latest` records first, then
    /// the height and cid indexes. Returns the parent meta for the next
    /// snapshot.
    pub fn put_checkpoint(
        &self,
        stable: &StableCheckpoint,
        snapshot: &Checkpoint,
    ) -> Result<ParentMeta, Error> {
        let app_bytes = snapshot.to_bytes()?;
        let stable_bytes = stable.serialize()?;
        let snapshot_cid = snapshot.cid()?;

        self.store.put(LATEST_KEY, &app_bytes)?;
        self.store.put(LATEST_PB_KEY, &stable_bytes)?;
        self.store
            .put(&height_index_key(snapshot.height), &stable_bytes)?;
        self.store.put(&cid_index_key(&snapshot_cid), &app_bytes)?;

        Ok(ParentMeta {
            height: snapshot.height,
            cid: snapshot_cid,
        })
    }
}
