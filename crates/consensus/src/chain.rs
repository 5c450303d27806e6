//! Host-chain API seams.
//!
//! The adapter consumes the chain node through these narrow traits: block
//! store, mempool, sync, and wallet stay on the host's side. Every method
//! may block on I/O and must honor the adapter's cancellation context at the
//! call sites.

use async_trait::async_trait;
use libp2p::PeerId;
use mir_types::{
    Address, Block, BlockTemplate, Height, Signature, SignedMessage, Tipset, TipsetKey,
};

/// The slice of the full-node API this consensus drives.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn state_network_name(&self) -> anyhow::Result<String>;

    async fn chain_head(&self) -> anyhow::Result<Tipset>;

    async fn chain_get_genesis(&self) -> anyhow::Result<Tipset>;

    /// Tipset at the given height (exactly one block per height here).
    async fn chain_get_tipset_by_height(&self, height: Height) -> anyhow::Result<Tipset>;

    /// Select up to `max` messages from the mempool, anchored at `base`.
    async fn mpool_select(
        &self,
        base: &TipsetKey,
        max: usize,
    ) -> anyhow::Result<Vec<SignedMessage>>;

    /// Assemble a block over the template's parents. `None` means there was
    /// nothing to build, which is not an error.
    async fn miner_create_block(&self, template: BlockTemplate) -> anyhow::Result<Option<Block>>;

    /// Hand a freshly produced block to the local syncer.
    async fn sync_submit_block(&self, block: Block) -> anyhow::Result<()>;

    /// Drop all chain state strictly above `keep`, in preparation for a
    /// checkpoint-driven recovery.
    async fn sync_purge_for_recovery(&self, keep: Height) -> anyhow::Result<()>;

    /// Currently connected peers.
    async fn net_peers(&self) -> anyhow::Result<Vec<PeerId>>;

    /// Ask one peer for the tipset identified by `key` and feed it to the
    /// local syncer.
    async fn sync_fetch_tipset_from_peer(
        &self,
        peer: PeerId,
        key: &TipsetKey,
    ) -> anyhow::Result<Tipset>;
}

/// The host wallet, used to sign for this node's identity and to verify
/// other validators' signatures.
#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn sign(&self, addr: &Address, data: &[u8]) -> anyhow::Result<Signature>;

    async fn verify(
        &self,
        addr: &Address,
        data: &[u8],
        signature: &Signature,
    ) -> anyhow::Result<bool>;
}
