//! Mir consensus adapter.
//!
//! Plugs a BFT state-machine-replication engine into a Filecoin-style node
//! as an alternative to probabilistic leader election. The adapter:
//!
//! - bridges the host mempool into the engine's request stream
//!   ([`Manager`], [`RequestPool`]);
//! - applies ordered batches as blocks and maintains the epoch membership
//!   window ([`StateManager`]);
//! - persists and restores consensus state across restarts
//!   ([`CheckpointStore`], [`ConfigurationManager`]);
//! - validates Mir blocks on the host side ([`validation`], [`BlockCache`]).
//!
//! The engine itself, the chain store, mempool, sync, and wallet are
//! external collaborators consumed through the traits in [`chain`] and
//! `mir_smr`.

pub mod cache;
pub mod chain;
pub mod checkpoint_store;
pub mod config;
pub mod configuration;
pub mod crypto;
pub mod db;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod state_manager;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cache::BlockCache;
pub use checkpoint_store::CheckpointStore;
pub use config::{Config, ConsensusConfig, INTERCEPTOR_OUTPUT_ENV, MANGLER_ENV};
pub use configuration::{ConfigurationManager, VoteRecord, VoteRecords};
pub use crypto::WalletCrypto;
pub use db::{MemoryStore, MetadataStore, RocksDbStore};
pub use error::Error;
pub use manager::{
    Manager, READING_MEMBERSHIP_INTERVAL, RECONFIGURATION_INTERVAL, WAIT_FOR_MEMBERSHIP_TIMEOUT,
};
pub use pool::RequestPool;
pub use state_manager::StateManager;
