//! Validator configuration and environment knobs.

use crate::error::Error;
use mir_smr::{ManglerParams, NodeId, RecorderConfig, SmrParams, StableCheckpoint};
use mir_types::Address;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable enabling the engine event-log recorder. Records are
/// written under `<value>/<group>/<node id>`.
pub const INTERCEPTOR_OUTPUT_ENV: &str = "MIR_INTERCEPTOR_OUTPUT";

/// Environment variable enabling the message mangler, as
/// `<min delay ms>,<max delay ms>,<drop rate percent>`. Testing only.
pub const MANGLER_ENV: &str = "MIR_MANGLER";

/// Engine tuning knobs recognized by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusConfig {
    /// Checkpoint period factor; the period is this times the committee
    /// size. Must be positive.
    pub segment_length: u64,
    /// Membership look-ahead window `K`. Must be at least 1.
    pub config_offset: u64,
    pub max_propose_delay: Duration,
    pub pbft_view_change_sn_timeout: Duration,
    pub pbft_view_change_segment_timeout: Duration,
    /// Must be positive.
    pub max_transactions_in_batch: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let p = SmrParams::default();
        ConsensusConfig {
            segment_length: p.segment_length,
            config_offset: p.config_offset,
            max_propose_delay: p.max_propose_delay,
            pbft_view_change_sn_timeout: p.pbft_view_change_sn_timeout,
            pbft_view_change_segment_timeout: p.pbft_view_change_segment_timeout,
            max_transactions_in_batch: p.max_transactions_in_batch,
        }
    }
}

/// Full adapter configuration for one validator.
#[derive(Debug, Clone)]
pub struct Config {
    /// This validator's wallet address; its string form is the engine node
    /// id.
    pub addr: Address,
    pub consensus: ConsensusConfig,
    /// Start the engine from this checkpoint instead of the persisted or
    /// genesis one.
    pub initial_checkpoint: Option<StableCheckpoint>,
    /// When set, stable checkpoints are mirrored as files under this path.
    pub checkpoint_repo: Option<PathBuf>,
    /// Deployment group, used in event-log directory naming.
    pub group_name: String,
}

impl Config {
    pub fn new(addr: Address) -> Self {
        Config {
            addr,
            consensus: ConsensusConfig::default(),
            initial_checkpoint: None,
            checkpoint_repo: None,
            group_name: String::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.addr.to_string())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.consensus.segment_length == 0 {
            return Err(Error::Config("segment length must be positive".into()));
        }
        if self.consensus.config_offset == 0 {
            return Err(Error::Config(
                "config offset must be at least 1 epoch".into(),
            ));
        }
        if self.consensus.max_transactions_in_batch == 0 {
            return Err(Error::Config(
                "max transactions in batch must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn smr_params(&self) -> SmrParams {
        SmrParams {
            segment_length: self.consensus.segment_length,
            config_offset: self.consensus.config_offset,
            max_propose_delay: self.consensus.max_propose_delay,
            pbft_view_change_sn_timeout: self.consensus.pbft_view_change_sn_timeout,
            pbft_view_change_segment_timeout: self.consensus.pbft_view_change_segment_timeout,
            max_transactions_in_batch: self.consensus.max_transactions_in_batch,
        }
    }
}

/// Read the mangler parameters from the environment. Absent variable means
/// no mangling; a present but malformed value aborts startup rather than
/// silently running without perturbation.
pub fn mangler_from_env() -> Result<Option<ManglerParams>, Error> {
    let raw = match std::env::var(MANGLER_ENV) {
        Ok(v) if !v.is_empty() => v,
        _ => return Ok(None),
    };
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(Error::Config(format!(
            "{MANGLER_ENV} must be <min delay ms>,<max delay ms>,<drop rate percent>, got {raw:?}"
        )));
    }
    let parse = |s: &str, what: &str| -> Result<u64, Error> {
        s.parse()
            .map_err(|_| Error::Config(format!("{MANGLER_ENV}: invalid {what} {s:?}")))
    };
    let min_delay = Duration::from_millis(parse(parts[0], "min delay")?);
    let max_delay = Duration::from_millis(parse(parts[1], "max delay")?);
    let drop_rate = parse(parts[2], "drop rate")?;
    if max_delay < min_delay {
        return Err(Error::Config(format!(
            "{MANGLER_ENV}: max delay below min delay in {raw:?}"
        )));
    }
    if drop_rate > 100 {
        return Err(Error::Config(format!(
            "{MANGLER_ENV}: drop rate {drop_rate} is not a percentage"
        )));
    }
    Ok(Some(ManglerParams {
        min_delay,
        max_delay,
        drop_rate,
    }))
}

/// Set the mangler environment variable; test setup helper.
pub fn set_env_mangler_params(min_delay: Duration, max_delay: Duration, drop_rate: u64) {
    std::env::set_var(
        MANGLER_ENV,
        format!(
            "{},{},{}",
            min_delay.as_millis(),
            max_delay.as_millis(),
            drop_rate
        ),
    );
}

/// Event-log recorder destination for this node, if enabled.
pub fn recorder_from_env(group_name: &str, id: &NodeId) -> Option<RecorderConfig> {
    match std::env::var(INTERCEPTOR_OUTPUT_ENV) {
        Ok(dir) if !dir.is_empty() => Some(RecorderConfig {
            dir: Path::new(&dir).join(group_name).join(id.as_str()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("t1val0".parse().unwrap())
    }

    #[test]
    fn default_config_is_valid() {
        config().validate().unwrap();
    }

    #[test]
    fn zero_segment_length_is_rejected() {
        let mut cfg = config();
        cfg.consensus.segment_length = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_offset_must_be_at_least_one() {
        let mut cfg = config();
        cfg.consensus.config_offset = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    // One test owns MANGLER_ENV end to end; parallel tests must not share
    // the variable.
    #[test]
    fn mangler_env_parsing() {
        set_env_mangler_params(Duration::from_millis(200), Duration::from_secs(2), 10);
        let params = mangler_from_env().unwrap().unwrap();
        assert_eq!(params.min_delay, Duration::from_millis(200));
        assert_eq!(params.max_delay, Duration::from_secs(2));
        assert_eq!(params.drop_rate, 10);

        std::env::set_var(MANGLER_ENV, "not,quite");
        assert!(mangler_from_env().is_err());
        std::env::set_var(MANGLER_ENV, "100,50,0");
        assert!(mangler_from_env().is_err());
        std::env::set_var(MANGLER_ENV, "0,100,500");
        assert!(mangler_from_env().is_err());

        std::env::remove_var(MANGLER_ENV);
        assert!(mangler_from_env().unwrap().is_none());
    }

    #[test]
    fn recorder_path_includes_group_and_id() {
        std::env::set_var(INTERCEPTOR_OUTPUT_ENV, "/tmp/mir-events");
        let rec = recorder_from_env("testnet", &NodeId::from("t1val0")).unwrap();
        assert_eq!(rec.dir, PathBuf::from("/tmp/mir-events/testnet/t1val0"));
        std::env::remove_var(INTERCEPTOR_OUTPUT_ENV);
        assert!(recorder_from_env("testnet", &NodeId::from("t1val0")).is_none());
    }
}
