//! Narrow host-chain types.
//!
//! Only the header fields this consensus observes on the wire are modeled
//! (§ block validation): single parent, system-actor miner, height-as-
//! timestamp, the reused ticket/election-proof slots, and the signature
//! envelope. The chain's full block schema stays on the host's side of the
//! API seam.

use crate::{Address, Cid, Height, Signature};
use serde::{Deserialize, Serialize};

/// An unsigned chain message, narrowed to the fields the adapter keys on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub params: Vec<u8>,
}

/// A signed chain message: the unit carried by transport requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub signature: Signature,
}

impl SignedMessage {
    pub fn cid(&self) -> Cid {
        // Serialization of a fixed struct cannot fail.
        Cid::of(&serde_json::to_vec(self).expect("signed message encoding"))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Block header as this consensus sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub miner: Address,
    pub parents: Vec<Cid>,
    pub height: Height,
    /// Equal to `height` under this consensus; wall clocks would make block
    /// cids diverge across validators.
    pub timestamp: u64,
    pub win_count: u64,
    /// Reused VRF slot: serialized application checkpoint, or none for an
    /// ordinary block.
    pub ticket: Option<Vec<u8>>,
    /// Reused election-proof slot: serialized stable checkpoint carrying the
    /// BFT certificate, or none for an ordinary block.
    pub election_proof: Option<Vec<u8>>,
    pub parent_weight: u64,
    pub parent_state_root: Cid,
    /// Always absent: Mir blocks are not miner-signed.
    pub block_sig: Option<Signature>,
    /// Aggregate over the block's bls messages; present even when empty.
    pub bls_aggregate: Option<Signature>,
}

impl BlockHeader {
    pub fn cid(&self) -> Cid {
        Cid::of(&serde_json::to_vec(self).expect("block header encoding"))
    }

    /// Whether the two checkpoint slots are populated.
    pub fn has_checkpoint(&self) -> bool {
        self.ticket.is_some() && self.election_proof.is_some()
    }
}

/// A full block: header plus the messages it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub messages: Vec<SignedMessage>,
}

/// Canonical identifier of a tipset: the cids of its blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey(pub Vec<Cid>);

impl TipsetKey {
    pub fn single(cid: Cid) -> Self {
        TipsetKey(vec![cid])
    }
}

/// A tipset. Under this consensus every tipset holds exactly one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tipset {
    pub blocks: Vec<BlockHeader>,
}

impl Tipset {
    pub fn new(blocks: Vec<BlockHeader>) -> Self {
        Tipset { blocks }
    }

    pub fn height(&self) -> Height {
        self.blocks.first().map(|b| b.height).unwrap_or(Height(0))
    }

    pub fn key(&self) -> TipsetKey {
        TipsetKey(self.blocks.iter().map(BlockHeader::cid).collect())
    }

    /// The single block of a Mir tipset.
    pub fn block(&self) -> Option<&BlockHeader> {
        self.blocks.first()
    }
}

/// Template handed to the host chain to assemble a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub miner: Address,
    pub parents: TipsetKey,
    pub height: Height,
    pub timestamp: u64,
    pub ticket: Option<Vec<u8>>,
    pub election_proof: Option<Vec<u8>>,
    pub messages: Vec<SignedMessage>,
}
