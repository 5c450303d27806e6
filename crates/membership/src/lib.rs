//! Membership sources.
//!
//! A node learns its committee from a [`MembershipReader`]: a file, a plain
//! string, an environment variable, or a JSON-RPC agent that reads the
//! validator set from the parent chain. Sources are re-read on every call so
//! that edits take effect at the next reconfiguration tick; no file handle
//! outlives a read.

mod onchain;
mod source;

pub use onchain::OnChainMembership;
pub use source::{EnvMembership, FakeMembership, FileMembership, StringMembership};

use async_trait::async_trait;
use mir_types::{MembershipInfo, ValidatorSet, ValidatorSetError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("no membership config found in path {0}")]
    MissingFile(String),
    #[error("reading membership source: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty validator string")]
    EmptyInput,
    #[error(transparent)]
    Parse(#[from] ValidatorSetError),
    #[error("membership rpc: {0}")]
    Rpc(String),
    #[error("fake membership source")]
    Fake,
}

/// Uniform read-side over all membership sources.
#[async_trait]
pub trait MembershipReader: Send + Sync {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError>;
}

/// Parse one validator per line. Blank lines are not permitted; each line is
/// whitespace-trimmed before parsing.
pub(crate) fn validator_set_from_lines(
    input: &str,
    configuration_number: u64,
) -> Result<ValidatorSet, MembershipError> {
    if input.trim().is_empty() {
        return Err(MembershipError::EmptyInput);
    }
    let mut validators = Vec::new();
    for line in input.lines() {
        validators.push(line.trim().parse()?);
    }
    Ok(ValidatorSet::new(configuration_number, validators)?)
}

/// Parse a comma-separated validator list, trimming each element.
pub(crate) fn validator_set_from_string(
    input: &str,
    configuration_number: u64,
) -> Result<ValidatorSet, MembershipError> {
    if input.trim().is_empty() {
        return Err(MembershipError::EmptyInput);
    }
    let mut validators = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        validators.push(part.parse()?);
    }
    if validators.is_empty() {
        return Err(MembershipError::EmptyInput);
    }
    Ok(ValidatorSet::new(configuration_number, validators)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const V0: &str = "t1val0@/ip4/127.0.0.1/tcp/10000";
    const V1: &str = "t1val1@/ip4/127.0.0.1/tcp/10001";

    #[test]
    fn lines_parse_in_order() {
        let set = validator_set_from_lines(&format!("{V0}\n{V1}\n"), 0).unwrap();
        assert_eq!(set.size(), 2);
        assert_eq!(set.validators()[0].addr.as_str(), "t1val0");
        assert_eq!(set.validators()[1].addr.as_str(), "t1val1");
    }

    #[test]
    fn blank_line_is_rejected() {
        let err = validator_set_from_lines(&format!("{V0}\n\n{V1}\n"), 0).unwrap_err();
        assert!(matches!(err, MembershipError::Parse(_)));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            validator_set_from_lines("", 0),
            Err(MembershipError::EmptyInput)
        ));
        assert!(matches!(
            validator_set_from_string("  ", 0),
            Err(MembershipError::EmptyInput)
        ));
    }

    #[test]
    fn comma_string_parses_with_spaces() {
        let set = validator_set_from_string(&format!(" {V0} , {V1} "), 3).unwrap();
        assert_eq!(set.size(), 2);
        assert_eq!(set.configuration_number, 3);
    }

    #[test]
    fn missing_at_sign_is_rejected() {
        assert!(validator_set_from_string("t1val0/ip4/127.0.0.1/tcp/0", 0).is_err());
    }
}
