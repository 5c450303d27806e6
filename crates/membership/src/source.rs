//! Local membership sources: file, string, environment variable, fake.

use crate::{validator_set_from_lines, validator_set_from_string, MembershipError, MembershipReader};
use async_trait::async_trait;
use mir_types::{MembershipInfo, ValidatorSet};
use std::path::{Path, PathBuf};

/// File-backed membership.
///
/// Two layouts are accepted:
/// - plain text, one `<address>@<multiaddr>` per line (configuration number
///   0: the layout predates reconfiguration and never carries a number);
/// - a JSON validator set, the layout the ipc tooling writes, which carries
///   `configuration_number` explicitly.
///
/// The file is opened, parsed, and closed on every call, so edits take
/// effect at the next reconfiguration tick.
pub struct FileMembership {
    path: PathBuf,
}

impl FileMembership {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileMembership {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MembershipReader for FileMembership {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError> {
        if !self.path.exists() {
            return Err(MembershipError::MissingFile(
                self.path.display().to_string(),
            ));
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let set = parse_file_contents(&contents)?;
        Ok(MembershipInfo::new(set))
    }
}

fn parse_file_contents(contents: &str) -> Result<ValidatorSet, MembershipError> {
    if contents.trim_start().starts_with('{') {
        return ValidatorSet::from_bytes(contents.as_bytes())
            .map_err(|e| MembershipError::Rpc(format!("invalid validator set json: {e}")));
    }
    validator_set_from_lines(contents, 0)
}

/// Membership parsed from a comma-separated string.
pub struct StringMembership(pub String);

#[async_trait]
impl MembershipReader for StringMembership {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError> {
        let set = validator_set_from_string(&self.0, 0)?;
        Ok(MembershipInfo::new(set))
    }
}

/// Membership read from an environment variable holding the comma-separated
/// form. The variable is re-read on every call.
pub struct EnvMembership(pub String);

#[async_trait]
impl MembershipReader for EnvMembership {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError> {
        let input = std::env::var(&self.0).unwrap_or_default();
        if input.is_empty() {
            return Err(MembershipError::EmptyInput);
        }
        let set = validator_set_from_string(&input, 0)?;
        Ok(MembershipInfo::new(set))
    }
}

/// Always fails; exercises the manager's failure paths in tests.
pub struct FakeMembership;

#[async_trait]
impl MembershipReader for FakeMembership {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError> {
        Err(MembershipError::Fake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const V0: &str = "t1val0@/ip4/127.0.0.1/tcp/10000";
    const V1: &str = "t1val1@/ip4/127.0.0.1/tcp/10001";

    #[tokio::test]
    async fn file_membership_rereads_on_every_call() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{V0}").unwrap();
        file.flush().unwrap();

        let source = FileMembership::new(file.path());
        let info = source.membership_info().await.unwrap();
        assert_eq!(info.validator_set.size(), 1);

        writeln!(file, "{V1}").unwrap();
        file.flush().unwrap();
        let info = source.membership_info().await.unwrap();
        assert_eq!(info.validator_set.size(), 2);
    }

    #[tokio::test]
    async fn file_membership_reads_json_layout() {
        let set = validator_set_from_string(&format!("{V0},{V1}"), 7).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&set.to_bytes().unwrap()).unwrap();
        file.flush().unwrap();

        let info = FileMembership::new(file.path())
            .membership_info()
            .await
            .unwrap();
        assert_eq!(info.validator_set, set);
        assert_eq!(info.validator_set.configuration_number, 7);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = FileMembership::new("/nonexistent/membership")
            .membership_info()
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::MissingFile(_)));
    }

    #[tokio::test]
    async fn string_membership_parses() {
        let info = StringMembership(format!("{V0},{V1}"))
            .membership_info()
            .await
            .unwrap();
        assert_eq!(info.validator_set.size(), 2);
        assert_eq!(info.min_validators, 0);
    }

    #[tokio::test]
    async fn env_membership_follows_variable() {
        let var = "MIR_TEST_MEMBERSHIP_SOURCE";
        std::env::set_var(var, V0);
        let source = EnvMembership(var.to_string());
        assert_eq!(
            source.membership_info().await.unwrap().validator_set.size(),
            1
        );
        std::env::remove_var(var);
        assert!(matches!(
            source.membership_info().await,
            Err(MembershipError::EmptyInput)
        ));
    }

    #[tokio::test]
    async fn fake_membership_always_fails() {
        assert!(matches!(
            FakeMembership.membership_info().await,
            Err(MembershipError::Fake)
        ));
    }
}
