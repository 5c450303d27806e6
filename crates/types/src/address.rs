//! Filecoin-style addresses, narrowed to what the adapter needs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A chain address in its canonical string form.
///
/// Grammar: a network prefix (`f` for mainnet, `t` for testnets), a protocol
/// digit (`0` id, `1` secp256k1, `2` actor, `3` bls, `4` delegated), and a
/// non-empty base32/decimal payload. The adapter only ever compares, hashes,
/// and transports addresses; it never decodes payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("address {0:?} has an unknown network prefix")]
    UnknownNetwork(String),
    #[error("address {0:?} has an invalid protocol")]
    InvalidProtocol(String),
    #[error("address {0:?} has an invalid payload")]
    InvalidPayload(String),
}

impl Address {
    /// The system actor (id address 0). Mir blocks carry it as their miner
    /// because no single validator owns a block.
    pub fn system_actor() -> Address {
        Address("f00".to_string())
    }

    /// Whether this is an id-protocol address.
    pub fn is_id(&self) -> bool {
        self.0.as_bytes().get(1) == Some(&b'0')
    }

    /// Whether this address names the system actor, regardless of the
    /// network prefix it was rendered with.
    pub fn is_system_actor(&self) -> bool {
        self.0.len() == 3 && self.is_id() && self.0.ends_with('0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let network = chars.next().ok_or(AddressError::Empty)?;
        if network != 'f' && network != 't' {
            return Err(AddressError::UnknownNetwork(s.to_string()));
        }
        match chars.next() {
            Some('0'..='4') => {}
            _ => return Err(AddressError::InvalidProtocol(s.to_string())),
        }
        let payload = chars.as_str();
        if payload.is_empty()
            || !payload
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(AddressError::InvalidPayload(s.to_string()));
        }
        Ok(Address(s.to_string()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_forms() {
        for s in [
            "t1wpixt5mihkj75lfhrnaa6v56n27epvlgwparujy",
            "f3vvmn62lofvhjd2ugzca6sof2j2ubwok6cj4xxbfzz4yuxfkgobpihhd2thlanmsh3w2ptld2gqkn2jvlss4a",
            "f00",
            "t0123",
        ] {
            assert!(s.parse::<Address>().is_ok(), "{s} should parse");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!("".parse::<Address>(), Err(AddressError::Empty));
        assert!(matches!(
            "x1abc".parse::<Address>(),
            Err(AddressError::UnknownNetwork(_))
        ));
        assert!(matches!(
            "t9abc".parse::<Address>(),
            Err(AddressError::InvalidProtocol(_))
        ));
        assert!(matches!(
            "t1".parse::<Address>(),
            Err(AddressError::InvalidPayload(_))
        ));
        assert!(matches!(
            "t1ABC".parse::<Address>(),
            Err(AddressError::InvalidPayload(_))
        ));
    }

    #[test]
    fn system_actor_is_recognized_on_any_network() {
        assert!(Address::system_actor().is_system_actor());
        assert!("t00".parse::<Address>().unwrap().is_system_actor());
        assert!(!"t01".parse::<Address>().unwrap().is_system_actor());
        assert!(!"t1abc".parse::<Address>().unwrap().is_system_actor());
    }

    #[test]
    fn serde_round_trip_rejects_invalid() {
        let a: Address = "t1abc".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), a);
        assert!(serde_json::from_str::<Address>("\"bogus!\"").is_err());
    }
}
