//! Engine tuning parameters supplied by the adapter.

use std::time::Duration;

/// Parameters handed to the engine factory at startup.
///
/// `segment_length * |membership|` is the checkpoint period: longer
/// committees checkpoint proportionally less often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmrParams {
    /// Smallest run of heights assigned to one leader. Determines the
    /// checkpoint period together with the committee size.
    pub segment_length: u64,
    /// Number of epochs of membership look-ahead (`K`). Correctness requires
    /// at least 1.
    pub config_offset: u64,
    /// Upper bound on how long the engine waits before proposing a batch.
    pub max_propose_delay: Duration,
    /// PBFT view-change timeout per sequence number.
    pub pbft_view_change_sn_timeout: Duration,
    /// PBFT view-change timeout per segment.
    pub pbft_view_change_segment_timeout: Duration,
    /// Maximum number of transactions the engine packs into one batch.
    pub max_transactions_in_batch: usize,
}

impl Default for SmrParams {
    fn default() -> Self {
        SmrParams {
            segment_length: 1,
            config_offset: 2,
            max_propose_delay: Duration::from_millis(400),
            pbft_view_change_sn_timeout: Duration::from_secs(6),
            pbft_view_change_segment_timeout: Duration::from_secs(10),
            max_transactions_in_batch: 1024,
        }
    }
}
