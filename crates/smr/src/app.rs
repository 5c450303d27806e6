//! The application-logic contract the engine drives.

use crate::{EpochNr, Membership, Request, StableCheckpoint};
use async_trait::async_trait;

/// Application logic invoked by the SMR engine.
///
/// The engine calls these entry points from a single task, in a total order
/// shared by every correct replica. Any error returned here is treated as
/// fatal by the engine: the application has diverged or cannot make safe
/// progress, and the engine terminates with the error.
#[async_trait]
pub trait AppLogic: Send {
    /// Apply one totally-ordered batch of requests.
    async fn apply_txs(&mut self, batch: Vec<Request>) -> anyhow::Result<()>;

    /// Advance to epoch `nr` (always `current + 1`) and return the membership
    /// the engine should use for the new pending slot.
    async fn new_epoch(&mut self, nr: EpochNr) -> anyhow::Result<Membership>;

    /// Produce the application snapshot for the next checkpoint.
    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>>;

    /// A checkpoint has gathered agreement; persist it and schedule it for
    /// inclusion in the next block.
    async fn checkpoint(&mut self, chkp: StableCheckpoint) -> anyhow::Result<()>;

    /// The engine detected that this replica is out of sync; restore local
    /// state from the given checkpoint.
    async fn restore_state(&mut self, chkp: StableCheckpoint) -> anyhow::Result<()>;
}
