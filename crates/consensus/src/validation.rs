//! Block validation rules on the host-chain adapter side.
//!
//! Every Mir block must satisfy: exactly one parent, system-actor miner, no
//! block signature, aggregate signature present, `timestamp == height`,
//! `win_count == 0`, ticket and election proof either both populated
//! (checkpoint block) or both empty, and parent weight `parent.height + 1`.
//! Checkpoint blocks additionally carry a certificate that must verify
//! against the membership recorded for the checkpoint's epoch.

use crate::cache::{BlockCache, CacheError};
use crate::chain::WalletApi;
use mir_smr::{NodeId, StableCheckpoint};
use mir_types::{Address, BlockHeader, Checkpoint, Signature, Tipset};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("mir expects a zero wincount, got {0}")]
    NonZeroWinCount(u64),
    #[error("ticket and election proof must be both populated or both empty")]
    LoneCheckpointSlot,
    #[error("mir blocks have no signature")]
    UnexpectedBlockSignature,
    #[error("block had nil aggregate signature")]
    MissingAggregate,
    #[error("must have 1 parent, got {0}")]
    WrongParentCount(usize),
    #[error("mir blocks include the system actor as miner, got {0}")]
    WrongMiner(Address),
    #[error("block height not greater than parent height: {height} <= {parent}")]
    HeightNotAboveParent { height: u64, parent: u64 },
    #[error("mir blocks should include the block height as timestamp (ts={timestamp}, height={height})")]
    TimestampMismatch { timestamp: u64, height: u64 },
    #[error("parent weight mismatch: {header} (header) != {computed} (computed)")]
    ParentWeightMismatch { header: u64, computed: u64 },
    #[error("decoding checkpoint from ticket slot: {0}")]
    BadTicket(String),
    #[error("decoding stable checkpoint from election proof slot: {0}")]
    BadElectionProof(String),
    #[error("checkpoint content hash does not match the carried certificate")]
    CheckpointContentMismatch,
    #[error("checkpoint epoch {0} has no membership in the carried configuration")]
    MissingCheckpointMembership(u64),
    #[error("checkpoint certificate: {0}")]
    Certificate(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Weight of a tipset: just `height + 1`. Every tipset has a single block,
/// so the chain with the highest block wins trivially.
pub fn weight(tipset: Option<&Tipset>) -> u64 {
    match tipset {
        Some(ts) => ts.height().0 + 1,
        None => 0,
    }
}

/// Stateless checks a peer can run when a block arrives via gossip.
pub fn block_sanity_checks(header: &BlockHeader) -> Result<(), ValidationError> {
    if header.win_count != 0 {
        return Err(ValidationError::NonZeroWinCount(header.win_count));
    }
    if header.ticket.is_some() != header.election_proof.is_some() {
        return Err(ValidationError::LoneCheckpointSlot);
    }
    if header.block_sig.is_some() {
        return Err(ValidationError::UnexpectedBlockSignature);
    }
    if header.bls_aggregate.is_none() {
        return Err(ValidationError::MissingAggregate);
    }
    if header.parents.len() != 1 {
        return Err(ValidationError::WrongParentCount(header.parents.len()));
    }
    if !header.miner.is_system_actor() {
        return Err(ValidationError::WrongMiner(header.miner.clone()));
    }
    Ok(())
}

/// Checks against the already-loaded parent tipset.
pub fn validate_against_parent(
    header: &BlockHeader,
    parent: &Tipset,
) -> Result<(), ValidationError> {
    if header.height <= parent.height() {
        return Err(ValidationError::HeightNotAboveParent {
            height: header.height.0,
            parent: parent.height().0,
        });
    }
    if header.timestamp != header.height.0 {
        return Err(ValidationError::TimestampMismatch {
            timestamp: header.timestamp,
            height: header.height.0,
        });
    }
    let computed = weight(Some(parent));
    if header.parent_weight != computed {
        return Err(ValidationError::ParentWeightMismatch {
            header: header.parent_weight,
            computed,
        });
    }
    Ok(())
}

/// Verify the checkpoint a block carries, if any, and run the block through
/// the cache cross-check.
///
/// For a checkpoint block: decode both slots, require the ticket snapshot to
/// be the one the certificate covers, verify a weak quorum of membership
/// signatures through the wallet, and hand the checkpoint to the cache so
/// previously received blocks are certified. Ordinary blocks are only cached.
pub async fn validate_block_checkpoint(
    header: &BlockHeader,
    wallet: &dyn WalletApi,
    cache: &BlockCache,
) -> Result<(), ValidationError> {
    if let (Some(ticket), Some(eproof)) = (&header.ticket, &header.election_proof) {
        let snapshot =
            Checkpoint::from_bytes(ticket).map_err(|e| ValidationError::BadTicket(e.to_string()))?;
        let stable = StableCheckpoint::deserialize(eproof)
            .map_err(|e| ValidationError::BadElectionProof(e.to_string()))?;

        if stable.snapshot.app_data != *ticket {
            return Err(ValidationError::CheckpointContentMismatch);
        }

        let membership = stable
            .snapshot
            .epoch_config
            .current_membership()
            .ok_or(ValidationError::MissingCheckpointMembership(
                stable.epoch().0,
            ))?;

        // The certificate signs the snapshot bytes. Wallet verification is
        // async, so resolve each signature once and close over the results.
        let mut verified: BTreeMap<NodeId, bool> = BTreeMap::new();
        for (node, sig) in &stable.cert.signatures {
            verified.insert(
                node.clone(),
                verify_node_signature(wallet, node, &stable.snapshot.app_data, sig).await,
            );
        }
        stable
            .cert
            .verify(&stable.snapshot.app_data, membership, |node, _, _| {
                verified.get(node).copied().unwrap_or(false)
            })
            .map_err(|e| ValidationError::Certificate(e.to_string()))?;

        cache.receive_checkpoint(&snapshot)?;
    }

    // The genesis block is taken as verified; everything else is cached so
    // the next checkpoint can certify it.
    if header.height.0 != 0 {
        cache.receive_block(header.height, header.cid())?;
    }
    Ok(())
}

async fn verify_node_signature(
    wallet: &dyn WalletApi,
    node: &NodeId,
    data: &[u8],
    sig: &[u8],
) -> bool {
    let Ok(addr) = node.as_str().parse::<Address>() else {
        return false;
    };
    let Ok(signature) = serde_json::from_slice::<Signature>(sig) else {
        return false;
    };
    wallet
        .verify(&addr, data, &signature)
        .await
        .unwrap_or(false)
}
