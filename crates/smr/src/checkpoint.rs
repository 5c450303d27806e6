//! Stable checkpoints as produced by the engine.
//!
//! A stable checkpoint wraps the application snapshot together with the
//! engine-internal epoch configuration and the BFT certificate attesting
//! agreement on it. The adapter persists the full serialized form and embeds
//! it in block headers; it never looks inside the certificate beyond
//! verifying it.

use crate::{weak_quorum, EpochNr, Membership, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Engine-side view of the membership schedule at the time of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochConfig {
    /// Epoch the checkpoint belongs to.
    pub epoch: EpochNr,
    /// Memberships known at checkpoint time: the checkpoint epoch plus the
    /// engine's look-ahead window.
    pub memberships: BTreeMap<EpochNr, Membership>,
}

impl EpochConfig {
    /// Membership of the checkpoint's own epoch.
    pub fn current_membership(&self) -> Option<&Membership> {
        self.memberships.get(&self.epoch)
    }
}

/// Application snapshot plus the epoch configuration it was taken under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Opaque application data; for this adapter, a serialized chain
    /// checkpoint. Empty for the synthetic genesis checkpoint.
    pub app_data: Vec<u8>,
    pub epoch_config: EpochConfig,
}

/// Aggregate of per-node signatures over a snapshot.
///
/// The signature scheme is the host's; verification is parameterized over a
/// callback so this crate stays crypto-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Certificate {
    pub signatures: BTreeMap<NodeId, Vec<u8>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("certificate has {got} valid signatures, weak quorum is {need}")]
    BelowQuorum { got: usize, need: usize },
    #[error("signer {0} is not in the checkpoint epoch membership")]
    UnknownSigner(NodeId),
}

impl Certificate {
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Verify the certificate against the membership recorded for the
    /// checkpoint's epoch.
    ///
    /// `verify_sig(node, data, sig)` must return true iff `sig` is a valid
    /// signature by `node` over `data`. The certificate is accepted when a
    /// weak quorum of distinct members produced valid signatures: agreement
    /// safety is already the engine's job, the adapter only needs one honest
    /// attestation.
    pub fn verify<F>(
        &self,
        data: &[u8],
        membership: &Membership,
        verify_sig: F,
    ) -> Result<(), CertificateError>
    where
        F: Fn(&NodeId, &[u8], &[u8]) -> bool,
    {
        let mut valid = 0usize;
        for (node, sig) in &self.signatures {
            if !membership.contains(node) {
                return Err(CertificateError::UnknownSigner(node.clone()));
            }
            if verify_sig(node, data, sig) {
                valid += 1;
            }
        }
        let need = weak_quorum(membership.len());
        if valid < need {
            return Err(CertificateError::BelowQuorum { got: valid, need });
        }
        Ok(())
    }
}

/// A checkpoint the engine has agreement on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableCheckpoint {
    /// Engine sequence number at which the checkpoint was taken.
    pub sn: u64,
    pub snapshot: Snapshot,
    pub cert: Certificate,
}

#[derive(Debug, Error)]
pub enum CheckpointCodecError {
    #[error("serializing stable checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("deserializing stable checkpoint: {0}")]
    Decode(#[source] serde_json::Error),
}

impl StableCheckpoint {
    /// Build the initial checkpoint of a fresh deployment: every epoch in the
    /// look-ahead window shares the initial membership, no certificate.
    pub fn genesis(
        app_data: Vec<u8>,
        membership: Membership,
        config_offset: u64,
        genesis_epoch: EpochNr,
    ) -> Self {
        let mut memberships = BTreeMap::new();
        for e in 0..config_offset + 2 {
            memberships.insert(EpochNr(genesis_epoch.0 + e), membership.clone());
        }
        StableCheckpoint {
            sn: 0,
            snapshot: Snapshot {
                app_data,
                epoch_config: EpochConfig {
                    epoch: genesis_epoch,
                    memberships,
                },
            },
            cert: Certificate::default(),
        }
    }

    pub fn epoch(&self) -> EpochNr {
        self.snapshot.epoch_config.epoch
    }

    /// Full engine-serialized form, suitable for persistence and for the
    /// election-proof header slot.
    pub fn serialize(&self) -> Result<Vec<u8>, CheckpointCodecError> {
        serde_json::to_vec(self).map_err(CheckpointCodecError::Encode)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CheckpointCodecError> {
        serde_json::from_slice(bytes).map_err(CheckpointCodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::Multiaddr;

    fn member(i: usize) -> (NodeId, Multiaddr) {
        (
            NodeId(format!("t1node{i}")),
            format!("/ip4/127.0.0.1/tcp/{}", 10000 + i).parse().unwrap(),
        )
    }

    fn membership(n: usize) -> Membership {
        (0..n).map(member).collect()
    }

    #[test]
    fn genesis_checkpoint_window_covers_offset_plus_two() {
        let chkp = StableCheckpoint::genesis(vec![], membership(4), 2, EpochNr(0));
        assert_eq!(chkp.epoch(), EpochNr(0));
        assert_eq!(chkp.snapshot.epoch_config.memberships.len(), 4);
        assert!(chkp.cert.is_empty());
    }

    #[test]
    fn stable_checkpoint_round_trip() {
        let mut chkp = StableCheckpoint::genesis(b"snap".to_vec(), membership(4), 1, EpochNr(0));
        chkp.sn = 42;
        chkp.cert
            .signatures
            .insert(NodeId::from("t1node0"), vec![0xaa]);

        let bytes = chkp.serialize().unwrap();
        let back = StableCheckpoint::deserialize(&bytes).unwrap();
        assert_eq!(chkp, back);
    }

    #[test]
    fn certificate_requires_weak_quorum_of_members() {
        let m = membership(4); // weak quorum = 2
        let data = b"checkpointed state";

        let mut cert = Certificate::default();
        cert.signatures.insert(NodeId::from("t1node0"), vec![1]);
        assert_eq!(
            cert.verify(data, &m, |_, _, _| true),
            Err(CertificateError::BelowQuorum { got: 1, need: 2 })
        );

        cert.signatures.insert(NodeId::from("t1node1"), vec![1]);
        assert_eq!(cert.verify(data, &m, |_, _, _| true), Ok(()));

        // Invalid signatures do not count towards the quorum.
        assert_eq!(
            cert.verify(data, &m, |_, _, _| false),
            Err(CertificateError::BelowQuorum { got: 0, need: 2 })
        );
    }

    #[test]
    fn certificate_rejects_foreign_signer() {
        let m = membership(4);
        let mut cert = Certificate::default();
        cert.signatures.insert(NodeId::from("t1stranger"), vec![1]);
        assert_eq!(
            cert.verify(b"x", &m, |_, _, _| true),
            Err(CertificateError::UnknownSigner(NodeId::from("t1stranger")))
        );
    }
}
