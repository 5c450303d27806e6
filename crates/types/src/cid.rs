//! Content identifiers.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content id: a blake3 digest over the canonical encoding of a value.
///
/// Displayed and serialized as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// All-zero cid, used as a placeholder where no content exists yet.
    pub const ZERO: Cid = Cid([0u8; 32]);

    /// Hash arbitrary bytes into a cid.
    pub fn of(bytes: &[u8]) -> Self {
        Cid(*blake3::hash(bytes).as_bytes())
    }

    /// Wrap an existing 32-byte digest without hashing.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Cid(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid cid: {0}")]
pub struct CidParseError(String);

impl FromStr for Cid {
    type Err = CidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CidParseError(e.to_string()))?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CidParseError(format!("expected 32 bytes, got {}", s.len() / 2)))?;
        Ok(Cid(digest))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        assert_eq!(Cid::of(b"block"), Cid::of(b"block"));
        assert_ne!(Cid::of(b"block"), Cid::of(b"other"));
    }

    #[test]
    fn display_parse_round_trip() {
        let c = Cid::of(b"some content");
        let parsed: Cid = c.to_string().parse().unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn serde_round_trip() {
        let c = Cid::of(b"serialized");
        let json = serde_json::to_string(&c).unwrap();
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }

    #[test]
    fn rejects_short_hex() {
        assert!("abcd".parse::<Cid>().is_err());
        assert!("zz".repeat(32).parse::<Cid>().is_err());
    }
}
