//! Adapter metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters; use
//! traces for event-level granularity during investigations.

use prometheus::{register_counter, register_gauge, Counter, Gauge};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub struct Metrics {
    // === Block production ===
    pub blocks_produced: Counter,
    pub chain_height: Gauge,

    // === Checkpoints ===
    pub checkpoints_persisted: Counter,
    pub checkpoints_mirrored: Counter,
    pub checkpoint_height: Gauge,

    // === Reconfiguration ===
    pub reconfiguration_requests_sent: Counter,
    pub reconfigurations_applied: Counter,
    pub current_epoch: Gauge,
    pub membership_size: Gauge,
    pub membership_poll_failures: Counter,

    // === Request pool ===
    pub request_pool_size: Gauge,

    // === Recovery ===
    pub restore_attempts: Counter,
}

impl Metrics {
    fn new() -> Self {
        Metrics {
            blocks_produced: register_counter!(
                "mir_blocks_produced_total",
                "Blocks assembled and submitted to the local syncer"
            )
            .unwrap(),
            chain_height: register_gauge!(
                "mir_chain_height",
                "Height of the last block this validator produced"
            )
            .unwrap(),
            checkpoints_persisted: register_counter!(
                "mir_checkpoints_persisted_total",
                "Stable checkpoints written to the metadata store"
            )
            .unwrap(),
            checkpoints_mirrored: register_counter!(
                "mir_checkpoints_mirrored_total",
                "Stable checkpoints mirrored to the checkpoint repository"
            )
            .unwrap(),
            checkpoint_height: register_gauge!(
                "mir_checkpoint_height",
                "Height of the latest stable checkpoint"
            )
            .unwrap(),
            reconfiguration_requests_sent: register_counter!(
                "mir_reconfiguration_requests_sent_total",
                "Configuration requests produced by this validator"
            )
            .unwrap(),
            reconfigurations_applied: register_counter!(
                "mir_reconfigurations_applied_total",
                "Pending memberships replaced after reaching a weak quorum"
            )
            .unwrap(),
            current_epoch: register_gauge!("mir_current_epoch", "Current engine epoch").unwrap(),
            membership_size: register_gauge!(
                "mir_membership_size",
                "Size of the current epoch's membership"
            )
            .unwrap(),
            membership_poll_failures: register_counter!(
                "mir_membership_poll_failures_total",
                "Failed reads of the membership source"
            )
            .unwrap(),
            request_pool_size: register_gauge!(
                "mir_request_pool_size",
                "In-flight transport requests"
            )
            .unwrap(),
            restore_attempts: register_counter!(
                "mir_restore_attempts_total",
                "Checkpoint-driven state restorations started"
            )
            .unwrap(),
        }
    }
}

/// Global metrics handle; registers on first use.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
