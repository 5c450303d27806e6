//! Chain-facing domain types for the Mir consensus adapter.
//!
//! This crate provides the types the adapter shares with the host chain:
//!
//! - **Primitives**: [`Cid`], [`Address`], [`Signature`], [`Height`]
//! - **Membership**: [`Validator`], [`ValidatorSet`], [`MembershipInfo`]
//! - **Checkpoints**: the application [`Checkpoint`] and its [`ParentMeta`]
//! - **Narrow host-chain types**: [`BlockHeader`], [`SignedMessage`],
//!   [`Tipset`], [`BlockTemplate`]
//!
//! The host-chain types mirror only the header fields this consensus
//! observes on the wire; everything else about the chain stays behind the
//! adapter's API seams.

mod address;
mod block;
mod checkpoint;
mod cid;
mod signature;
mod validator;

pub use address::{Address, AddressError};
pub use block::{
    Block, BlockHeader, BlockTemplate, Message, SignedMessage, Tipset, TipsetKey,
};
pub use checkpoint::{Checkpoint, CheckpointError, ParentMeta};
pub use cid::Cid;
pub use signature::{Signature, SignatureKind};
pub use validator::{MembershipInfo, Validator, ValidatorSet, ValidatorSetError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chain height (one block per height under this consensus).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Height(pub u64);

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_ordering_and_display() {
        assert!(Height(2) > Height(1));
        assert_eq!(Height(42).to_string(), "42");
    }
}
