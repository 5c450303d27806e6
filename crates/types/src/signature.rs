//! Signature envelope shared with the host chain.

use serde::{Deserialize, Serialize};

/// Scheme a [`Signature`] was produced under. The adapter never verifies
/// payloads itself; the wallet seam does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureKind {
    Secp256k1,
    Bls,
    Delegated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub kind: SignatureKind,
    pub bytes: Vec<u8>,
}

impl Signature {
    pub fn new(kind: SignatureKind, bytes: Vec<u8>) -> Self {
        Signature { kind, bytes }
    }
}
