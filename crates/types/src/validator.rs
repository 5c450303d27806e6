//! Validators, validator sets, and membership info.

use crate::{Address, AddressError, Cid};
use libp2p::Multiaddr;
use mir_smr::{Membership, NodeId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A committee member: a chain address plus the multi-address its engine
/// transport listens on.
///
/// String grammar: `<address>@<multiaddr>`, e.g.
/// `t1wpixt5mihkj75lfhrnaa6v56n27epvlgwparujy@/ip4/127.0.0.1/tcp/10000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub addr: Address,
    pub net_addr: Multiaddr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("validator entry {0:?} is not of the form <address>@<multiaddr>")]
    MissingSeparator(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("invalid multiaddr in {input:?}: {reason}")]
    Multiaddr { input: String, reason: String },
    #[error("duplicate validator address {0}")]
    DuplicateAddress(Address),
    #[error("empty validator set")]
    Empty,
}

impl Validator {
    pub fn new(addr: Address, net_addr: Multiaddr) -> Self {
        Validator { addr, net_addr }
    }

    /// The validator's engine node id: the string form of its address.
    pub fn id(&self) -> NodeId {
        NodeId(self.addr.to_string())
    }

    /// Canonical bytes used for validator-set hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut b = self.to_string().into_bytes();
        b.push(b'\n');
        b
    }
}

impl FromStr for Validator {
    type Err = ValidatorSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, net_addr) = s
            .split_once('@')
            .ok_or_else(|| ValidatorSetError::MissingSeparator(s.to_string()))?;
        let addr: Address = addr.parse()?;
        let net_addr: Multiaddr =
            net_addr
                .parse()
                .map_err(|e: libp2p::multiaddr::Error| ValidatorSetError::Multiaddr {
                    input: s.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(Validator { addr, net_addr })
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.net_addr)
    }
}

impl Serialize for Validator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Validator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Ordered list of validators plus the configuration number the set was
/// published under.
///
/// Invariants: validators are unique by address; the content hash is stable
/// under reconstruction from the same ordered list. Equality is by content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub configuration_number: u64,
    validators: Vec<Validator>,
}

impl ValidatorSet {
    pub fn new(
        configuration_number: u64,
        validators: Vec<Validator>,
    ) -> Result<Self, ValidatorSetError> {
        let mut seen = BTreeSet::new();
        for v in &validators {
            if !seen.insert(v.addr.clone()) {
                return Err(ValidatorSetError::DuplicateAddress(v.addr.clone()));
            }
        }
        Ok(ValidatorSet {
            configuration_number,
            validators,
        })
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn validator_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.validators.iter().map(Validator::id)
    }

    pub fn has_validator(&self, id: &NodeId) -> bool {
        self.validators.iter().any(|v| &v.id() == id)
    }

    /// Look up a validator by its engine node id.
    pub fn validator(&self, id: &NodeId) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.id() == id)
    }

    /// Content hash: digest of the concatenated canonical encodings of each
    /// validator, in order.
    pub fn hash(&self) -> Cid {
        let mut bytes = Vec::new();
        for v in &self.validators {
            bytes.extend_from_slice(&v.canonical_bytes());
        }
        Cid::of(&bytes)
    }

    /// Convert the set into the engine's membership map, preserving the
    /// address→node-id correspondence.
    pub fn membership(&self) -> Membership {
        self.validators
            .iter()
            .map(|v| (v.id(), v.net_addr.clone()))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Everything a membership source reports: the set itself, the minimum
/// committee size the node may start with, and the epoch the subnet's chain
/// was bootstrapped at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipInfo {
    pub validator_set: ValidatorSet,
    #[serde(default)]
    pub min_validators: u64,
    #[serde(default)]
    pub genesis_epoch: u64,
}

impl MembershipInfo {
    pub fn new(validator_set: ValidatorSet) -> Self {
        MembershipInfo {
            validator_set,
            min_validators: 0,
            genesis_epoch: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(i: usize) -> Validator {
        format!("t1val{i}@/ip4/127.0.0.1/tcp/{}", 10000 + i)
            .parse()
            .unwrap()
    }

    #[test]
    fn validator_string_round_trip() {
        let v = validator(0);
        let round: Validator = v.to_string().parse().unwrap();
        assert_eq!(v, round);
        assert_eq!(v.id(), NodeId("t1val0".into()));
    }

    #[test]
    fn validator_parse_trims_whitespace() {
        let v: Validator = "  t1val0@/ip4/127.0.0.1/tcp/10000  ".parse().unwrap();
        assert_eq!(v.addr.as_str(), "t1val0");
    }

    #[test]
    fn validator_parse_requires_separator() {
        assert!(matches!(
            "t1val0/ip4/127.0.0.1/tcp/10000".parse::<Validator>(),
            Err(ValidatorSetError::MissingSeparator(_))
        ));
        assert!(matches!(
            "t1val0@not-a-multiaddr".parse::<Validator>(),
            Err(ValidatorSetError::Multiaddr { .. })
        ));
    }

    #[test]
    fn set_rejects_duplicate_addresses() {
        let err = ValidatorSet::new(0, vec![validator(1), validator(1)]).unwrap_err();
        assert!(matches!(err, ValidatorSetError::DuplicateAddress(_)));
    }

    #[test]
    fn hash_is_stable_under_reconstruction() {
        let a = ValidatorSet::new(0, vec![validator(0), validator(1)]).unwrap();
        let b = ValidatorSet::new(0, vec![validator(0), validator(1)]).unwrap();
        assert_eq!(a.hash(), b.hash());

        // Order matters: the hash covers the ordered list.
        let c = ValidatorSet::new(0, vec![validator(1), validator(0)]).unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn equality_is_by_content() {
        let a = ValidatorSet::new(1, vec![validator(0)]).unwrap();
        let b = ValidatorSet::new(1, vec![validator(0)]).unwrap();
        let c = ValidatorSet::new(2, vec![validator(0)]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn membership_preserves_ids_and_addresses() {
        let set = ValidatorSet::new(0, vec![validator(0), validator(1)]).unwrap();
        let m = set.membership();
        assert_eq!(m.len(), 2);
        for v in set.validators() {
            assert_eq!(m.addr(&v.id()), Some(&v.net_addr));
        }
    }

    #[test]
    fn set_serde_round_trip() {
        let set = ValidatorSet::new(3, vec![validator(0), validator(1)]).unwrap();
        let bytes = set.to_bytes().unwrap();
        let back = ValidatorSet::from_bytes(&bytes).unwrap();
        assert_eq!(set, back);
        assert_eq!(set.hash(), back.hash());
    }
}
