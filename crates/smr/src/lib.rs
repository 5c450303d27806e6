//! Contract between the consensus adapter and the SMR engine.
//!
//! The engine is an opaque BFT primitive providing total ordering, stable
//! checkpoints, and view changes. This crate defines everything the adapter
//! needs to know about it, and nothing else:
//!
//! - **Identifiers**: [`NodeId`], [`EpochNr`], the ordered [`Membership`] map
//! - **Requests**: the [`Request`] wire unit fed to the engine
//! - **Checkpoints**: [`Snapshot`], [`Certificate`], [`StableCheckpoint`]
//! - **Application contract**: the [`AppLogic`] trait invoked by the engine
//! - **Engine seam**: [`Engine`], [`EngineFactory`], and the [`BatchFetcher`]
//!   request/response pull
//!
//! The crate is deliberately chain-agnostic: it knows nothing about blocks,
//! addresses, or wallets. The adapter translates on its side of the seam.

mod app;
mod checkpoint;
mod engine;
mod membership;
mod params;
mod request;

pub use app::AppLogic;
pub use checkpoint::{
    Certificate, CertificateError, CheckpointCodecError, EpochConfig, Snapshot, StableCheckpoint,
};
pub use engine::{
    batch_channel, BatchFetcher, BatchRequest, Crypto, Engine, EngineError, EngineFactory,
    EngineSetup, ManglerParams, RecorderConfig, Transport,
};
pub use membership::{Membership, NodeId};
pub use params::SmrParams;
pub use request::{Request, RequestKind};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine epoch number (monotonically increasing).
///
/// An epoch is a contiguous range of heights under one committee
/// configuration. Not to be confused with the host chain's height.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EpochNr(pub u64);

impl EpochNr {
    pub fn next(self) -> Self {
        EpochNr(self.0 + 1)
    }
}

impl fmt::Display for EpochNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maximum number of faulty nodes tolerated in a committee of `n`,
/// assuming `n > 3f`.
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Weak quorum: the smallest number of nodes guaranteed to contain at least
/// one honest node, i.e. `f + 1`.
pub fn weak_quorum(n: usize) -> usize {
    max_faulty(n) + 1
}
