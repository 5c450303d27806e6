//! Error kinds of the consensus adapter.
//!
//! The propagation policy: anything that could make two validators disagree
//! is fatal and surfaces up to process exit; anything that merely delays
//! progress is logged and retried at the next tick.

use crate::db::DbError;
use mir_membership::MembershipError;
use mir_smr::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // ── Configuration errors, surfaced on startup ───────────────────────
    /// This node's identity is not in the membership yet; the caller keeps
    /// polling.
    #[error("validator failed to find its identity in membership")]
    MissingOwnIdentity,

    /// The committee is smaller than the configured floor; the caller keeps
    /// polling.
    #[error("minimum number of validators for subnet not reached: have {have}, need {need}")]
    MinValidatorsNotReached { have: usize, need: u64 },

    #[error("empty validator set")]
    EmptyValidatorSet,

    #[error("getting membership timeout expired")]
    MembershipTimeout,

    #[error("membership source: {0}")]
    Membership(#[from] MembershipError),

    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Host chain and persistence ──────────────────────────────────────
    #[error("host chain: {0}")]
    Chain(#[source] anyhow::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Checkpoint(#[from] mir_types::CheckpointError),

    #[error(transparent)]
    StableCheckpoint(#[from] mir_smr::CheckpointCodecError),

    #[error("decoding persisted record {key}: {reason}")]
    Codec { key: String, reason: String },

    // ── Fatal ───────────────────────────────────────────────────────────
    /// An ordering invariant the engine guarantees was violated; the
    /// replicas have diverged.
    #[error("state machine fault: {0}")]
    StateMachineFault(String),

    /// The node cannot safely resume from a checkpoint.
    #[error("restore failed: {0}")]
    RestoreFailure(String),

    /// The engine terminated unexpectedly; consensus cannot make safe
    /// progress without it.
    #[error("engine terminated: {0}")]
    Engine(#[from] EngineError),

    #[error("timed out waiting for block at height {0}")]
    WaitForBlockTimeout(u64),

    #[error("shutdown requested")]
    Cancelled,
}

impl Error {
    /// Whether the membership wait loop should keep polling on this error.
    pub fn is_retriable_membership(&self) -> bool {
        matches!(
            self,
            Error::MissingOwnIdentity | Error::MinValidatorsNotReached { .. }
        )
    }
}
