//! The application-logic side of the adapter.
//!
//! The state manager implements the engine's [`AppLogic`] contract: it turns
//! ordered batches into blocks, maintains the epoch membership window, drives
//! reconfiguration voting, and ties BFT finality to the chain through
//! checkpoints. All entry points run synchronously on the engine's task; the
//! only cross-task state is the request pool and the capacity-1 checkpoint
//! channel.

use crate::chain::ChainApi;
use crate::checkpoint_store::CheckpointStore;
use crate::configuration::{ConfigurationManager, VoteRecord, VoteRecords};
use crate::error::Error;
use crate::metrics::metrics;
use crate::pool::RequestPool;
use async_trait::async_trait;
use mir_smr::{
    weak_quorum, AppLogic, EpochNr, Membership, NodeId, Request, RequestKind, StableCheckpoint,
};
use mir_types::{
    Address, BlockTemplate, Checkpoint, Height, ParentMeta, SignedMessage, ValidatorSet,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Baseline wait when polling for the chain head to reach a height; one
/// extra second is added per missing block.
const WAIT_FOR_BLOCK_BASE_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_FOR_BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Votes collected for one proposed set within the current epoch.
#[derive(Debug, Clone, Default)]
struct VoteTally {
    configuration_number: u64,
    voters: BTreeSet<NodeId>,
}

pub struct StateManager {
    id: NodeId,
    chain: Arc<dyn ChainApi>,
    checkpoints: CheckpointStore,
    config_manager: Arc<ConfigurationManager>,
    pool: Arc<Mutex<RequestPool>>,
    cancel: CancellationToken,

    config_offset: u64,
    segment_length: u64,
    checkpoint_repo: Option<PathBuf>,

    current_epoch: EpochNr,
    /// Epoch → membership for the current epoch plus the look-ahead window.
    /// The entry at `current + config_offset + 1` is the only mutable one.
    memberships: BTreeMap<EpochNr, Membership>,
    /// Per-epoch votes, keyed by the hex content hash of the proposed set.
    votes: BTreeMap<EpochNr, BTreeMap<String, VoteTally>>,
    prev_checkpoint: ParentMeta,
    /// Height of the last block this replica assembled; the next batch must
    /// arrive with the chain head exactly there.
    last_applied: Option<Height>,

    /// Capacity-1 checkpoint hand-off into block production.
    next_checkpoint_tx: mpsc::Sender<StableCheckpoint>,
    next_checkpoint_rx: mpsc::Receiver<StableCheckpoint>,
}

impl StateManager {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        id: NodeId,
        initial_membership: Membership,
        genesis_epoch: EpochNr,
        chain: Arc<dyn ChainApi>,
        checkpoints: CheckpointStore,
        config_manager: Arc<ConfigurationManager>,
        pool: Arc<Mutex<RequestPool>>,
        cancel: CancellationToken,
        config_offset: u64,
        segment_length: u64,
        checkpoint_repo: Option<PathBuf>,
    ) -> Result<Self, Error> {
        // Seed the window: the genesis epoch, the config_offset epochs whose
        // membership is already fixed, and the first mutable slot.
        let mut memberships = BTreeMap::new();
        for e in 0..config_offset + 2 {
            memberships.insert(EpochNr(genesis_epoch.0 + e), initial_membership.clone());
        }

        // Seed the initial checkpoint state from the store, falling back to
        // the synthetic genesis checkpoint.
        let genesis = chain.chain_get_genesis().await.map_err(Error::Chain)?;
        let genesis_cid = genesis
            .block()
            .ok_or_else(|| Error::StateMachineFault("genesis tipset has no block".into()))?
            .cid();
        let first = checkpoints.latest_or_genesis(genesis_cid)?;
        let prev_checkpoint = first.parent_meta()?;

        let (next_checkpoint_tx, next_checkpoint_rx) = mpsc::channel(1);

        let mut sm = StateManager {
            id,
            chain,
            checkpoints,
            config_manager,
            pool,
            cancel,
            config_offset,
            segment_length,
            checkpoint_repo,
            current_epoch: genesis_epoch,
            memberships,
            votes: BTreeMap::new(),
            prev_checkpoint,
            last_applied: None,
            next_checkpoint_tx,
            next_checkpoint_rx,
        };
        sm.restore_persisted_votes()?;
        Ok(sm)
    }

    /// Load vote records that survived a restart into the current epoch.
    fn restore_persisted_votes(&mut self) -> Result<(), Error> {
        let records = self.config_manager.votes()?;
        if records.records.is_empty() {
            return Ok(());
        }
        let tallies = self.votes.entry(self.current_epoch).or_default();
        for record in records.records {
            let tally = tallies.entry(record.valset_hash.clone()).or_default();
            tally.configuration_number = record.configuration_number;
            tally.voters.extend(record.voted_validators);
        }
        info!(
            validator = %self.id,
            epoch = self.current_epoch.0,
            sets = tallies.len(),
            "restored persisted reconfiguration votes"
        );
        Ok(())
    }

    pub fn current_epoch(&self) -> EpochNr {
        self.current_epoch
    }

    pub fn prev_checkpoint(&self) -> ParentMeta {
        self.prev_checkpoint
    }

    /// Membership table snapshot; exposed for block validation and tests.
    pub fn memberships(&self) -> &BTreeMap<EpochNr, Membership> {
        &self.memberships
    }

    /// Checkpoint period for the current epoch: segment length times the
    /// committee size.
    pub fn checkpoint_period(&self) -> u64 {
        let members = self
            .memberships
            .get(&self.current_epoch)
            .map(Membership::len)
            .unwrap_or(0) as u64;
        self.segment_length * members
    }

    /// Timeout for waiting on a block `gap` heights away.
    pub fn wait_for_block_timeout(gap: u64) -> Duration {
        WAIT_FOR_BLOCK_BASE_TIMEOUT + Duration::from_secs(gap)
    }

    // ── Configuration voting ────────────────────────────────────────────

    /// Record `voter`'s vote for `set` in the current epoch, deduplicated by
    /// voter id. Returns true when the set has a weak quorum of the current
    /// membership.
    fn record_vote(&mut self, voter: NodeId, set: &ValidatorSet) -> bool {
        let hash = set.hash().to_string();
        let tallies = self.votes.entry(self.current_epoch).or_default();
        let tally = tallies.entry(hash).or_default();
        tally.configuration_number = set.configuration_number;
        tally.voters.insert(voter);

        let votes = tally.voters.len();
        let members = self
            .memberships
            .get(&self.current_epoch)
            .map(Membership::len)
            .unwrap_or(0);
        votes >= weak_quorum(members)
    }

    /// Persist the current epoch's vote records. Written together with every
    /// pending-membership update so a crash cannot split the two.
    fn persist_votes(&self) -> Result<(), Error> {
        let records = self
            .votes
            .get(&self.current_epoch)
            .map(|tallies| VoteRecords {
                records: tallies
                    .iter()
                    .map(|(hash, tally)| VoteRecord {
                        configuration_number: tally.configuration_number,
                        valset_hash: hash.clone(),
                        voted_validators: tally.voters.iter().cloned().collect(),
                    })
                    .collect(),
            })
            .unwrap_or_default();
        self.config_manager.put_votes(&records)
    }

    fn pending_slot(&self) -> EpochNr {
        EpochNr(self.current_epoch.0 + self.config_offset + 1)
    }

    /// Apply one ordered configuration request through the voting rule.
    fn apply_config_request(&mut self, request: &Request) -> Result<(), Error> {
        let set = ValidatorSet::from_bytes(&request.data).map_err(|e| {
            Error::StateMachineFault(format!("undecodable ordered validator set: {e}"))
        })?;
        let voter = NodeId(request.client_id.clone());

        if self.record_vote(voter.clone(), &set) {
            let slot = self.pending_slot();
            info!(
                validator = %self.id,
                epoch = self.current_epoch.0,
                configuration = set.configuration_number,
                size = set.size(),
                slot = slot.0,
                "reconfiguration reached weak quorum, replacing pending membership"
            );
            self.memberships.insert(slot, set.membership());
            metrics().reconfigurations_applied.inc();
        }
        self.persist_votes()?;

        // Our own outbound transaction has now been executed.
        if voter == self.id {
            self.config_manager.mark_applied(request.req_no)?;
        }
        Ok(())
    }

    // ── Checkpoint hand-off ─────────────────────────────────────────────

    /// Take the checkpoint pending inclusion, if any.
    fn poll_checkpoint(&mut self) -> Option<StableCheckpoint> {
        self.next_checkpoint_rx.try_recv().ok()
    }

    /// Drain a stale pending checkpoint; restoration must not leak an
    /// aborted catch-up into subsequent blocks.
    fn drain_checkpoint_channel(&mut self) {
        while self.next_checkpoint_rx.try_recv().is_ok() {}
    }

    /// Non-blocking push into the capacity-1 channel; a newer checkpoint
    /// replaces an unconsumed older one.
    fn push_checkpoint(&mut self, checkpoint: StableCheckpoint) {
        if let Err(mpsc::error::TrySendError::Full(checkpoint)) =
            self.next_checkpoint_tx.try_send(checkpoint)
        {
            self.drain_checkpoint_channel();
            let _ = self.next_checkpoint_tx.try_send(checkpoint);
        }
    }

    /// Persist an agreed checkpoint (four records, fixed order), mirror it
    /// to the file repository if configured, and schedule it for inclusion
    /// in the next block.
    fn deliver_checkpoint(
        &mut self,
        stable: StableCheckpoint,
        snapshot: &Checkpoint,
    ) -> Result<(), Error> {
        self.prev_checkpoint = self.checkpoints.put_checkpoint(&stable, snapshot)?;
        metrics().checkpoints_persisted.inc();
        metrics().checkpoint_height.set(snapshot.height.0 as f64);

        if let Some(repo) = &self.checkpoint_repo {
            // Best-effort mirror, off the critical path. Failure is logged,
            // never fatal.
            let path = repo.join(format!("checkpoint-{}.chkp", snapshot.height));
            let bytes = stable.serialize()?;
            tokio::spawn(async move {
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => metrics().checkpoints_mirrored.inc(),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "mirroring checkpoint failed")
                    }
                }
            });
        }

        debug!(
            validator = %self.id,
            height = snapshot.height.0,
            "checkpoint scheduled for inclusion in the next block"
        );
        self.push_checkpoint(stable);
        Ok(())
    }

    // ── Chain helpers ───────────────────────────────────────────────────

    /// Poll until the local chain head reaches `height`, bounded by a
    /// timeout scaled to the gap.
    async fn wait_for_block(&self, height: Height) -> Result<(), Error> {
        let base = self.chain.chain_head().await.map_err(Error::Chain)?;
        let gap = height.0.saturating_sub(base.height().0);
        let timeout = Self::wait_for_block_timeout(gap);
        debug!(
            validator = %self.id,
            height = height.0,
            gap,
            timeout_secs = timeout.as_secs(),
            "waiting for block"
        );

        let poll = async {
            loop {
                let head = self.chain.chain_head().await.map_err(Error::Chain)?.height();
                if head >= height {
                    if head > height {
                        warn!(
                            validator = %self.id,
                            waiting = height.0,
                            head = head.0,
                            "chain head is already past the awaited height"
                        );
                    }
                    return Ok(());
                }
                tokio::time::sleep(WAIT_FOR_BLOCK_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, poll) => {
                result.map_err(|_| Error::WaitForBlockTimeout(height.0))?
            }
        }
    }
}

#[async_trait]
impl AppLogic for StateManager {
    /// Apply one totally-ordered batch: route configuration requests through
    /// the voting rule, assemble the transport requests into the next block,
    /// and hand the block to the local syncer.
    async fn apply_txs(&mut self, batch: Vec<Request>) -> anyhow::Result<()> {
        let mut transport = Vec::new();
        for request in batch {
            match request.kind {
                RequestKind::Transport => transport.push(request),
                RequestKind::Configuration => self.apply_config_request(&request)?,
            }
        }

        let base = self.chain.chain_head().await.map_err(Error::Chain)?;
        if let Some(expected) = self.last_applied {
            if base.height() != expected {
                return Err(Error::StateMachineFault(format!(
                    "batch delivered over head {}, expected {}",
                    base.height(),
                    expected
                ))
                .into());
            }
        }
        let next_height = Height(base.height().0 + 1);

        let mut messages = Vec::with_capacity(transport.len());
        {
            let mut pool = self.pool.lock();
            for request in &transport {
                match SignedMessage::from_bytes(&request.data) {
                    Ok(msg) => {
                        pool.remove(&request.client_id, request.req_no);
                        messages.push(msg);
                    }
                    // Every replica sees the same bytes, so every replica
                    // skips the same request.
                    Err(e) => warn!(
                        validator = %self.id,
                        client = %request.client_id,
                        req_no = request.req_no,
                        error = %e,
                        "dropping undecodable transport request"
                    ),
                }
            }
            metrics().request_pool_size.set(pool.len() as f64);
        }

        let (ticket, election_proof) = match self.poll_checkpoint() {
            Some(stable) => {
                info!(
                    validator = %self.id,
                    height = next_height.0,
                    "including checkpoint in block"
                );
                (
                    Some(stable.snapshot.app_data.clone()),
                    Some(stable.serialize().map_err(Error::from)?),
                )
            }
            None => (None, None),
        };

        debug!(
            validator = %self.id,
            height = next_height.0,
            messages = messages.len(),
            "assembling block"
        );
        let template = BlockTemplate {
            // Blocks are produced by every validator; the system actor
            // stands in as the miner.
            miner: Address::system_actor(),
            parents: base.key(),
            height: next_height,
            // Wall clocks differ between validators; the height is the one
            // timestamp they agree on.
            timestamp: next_height.0,
            ticket,
            election_proof,
            messages,
        };

        match self
            .chain
            .miner_create_block(template)
            .await
            .map_err(Error::Chain)?
        {
            Some(block) => {
                self.chain
                    .sync_submit_block(block)
                    .await
                    .map_err(Error::Chain)?;
                info!(validator = %self.id, height = next_height.0, "produced block");
                metrics().blocks_produced.inc();
                metrics().chain_height.set(next_height.0 as f64);
            }
            None => debug!(validator = %self.id, height = next_height.0, "created a nil block"),
        }

        self.last_applied = Some(next_height);
        Ok(())
    }

    /// Slide the membership window: copy the last fixed membership into a
    /// fresh mutable slot, advance the epoch, and drop entries older than
    /// the previous epoch.
    async fn new_epoch(&mut self, nr: EpochNr) -> anyhow::Result<Membership> {
        if nr != self.current_epoch.next() {
            return Err(Error::StateMachineFault(format!(
                "expected next epoch to be {}, got {}",
                self.current_epoch.next(),
                nr
            ))
            .into());
        }

        let source = EpochNr(nr.0 + self.config_offset);
        let membership = self
            .memberships
            .get(&source)
            .cloned()
            .ok_or_else(|| Error::StateMachineFault(format!("no membership for epoch {source}")))?;
        self.memberships
            .insert(EpochNr(nr.0 + self.config_offset + 1), membership.clone());
        self.current_epoch = nr;

        // Without garbage collection the tables grow without bound.
        let keep_from = nr.0.saturating_sub(1);
        self.memberships.retain(|epoch, _| epoch.0 >= keep_from);
        self.votes.retain(|epoch, _| epoch.0 >= keep_from);

        info!(validator = %self.id, epoch = nr.0, members = membership.len(), "new epoch");
        metrics().current_epoch.set(nr.0 as f64);
        metrics().membership_size.set(membership.len() as f64);
        Ok(membership)
    }

    /// Collect the block cids covered since the previous checkpoint, newest
    /// first, waiting for the local head to catch up if needed.
    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>> {
        let next_height = Height(self.prev_checkpoint.height.0 + self.checkpoint_period());
        info!(
            validator = %self.id,
            epoch = self.current_epoch.0,
            height = next_height.0,
            "assembling checkpoint snapshot"
        );

        let mut checkpoint = Checkpoint {
            height: next_height,
            parent: self.prev_checkpoint,
            block_cids: Vec::new(),
        };

        // The newest covered block must be committed locally before the
        // snapshot can be assembled.
        let newest = Height(next_height.0 - 1);
        self.wait_for_block(newest).await?;

        let mut height = newest.0;
        while height >= self.prev_checkpoint.height.0 {
            let tipset = self
                .chain
                .chain_get_tipset_by_height(Height(height))
                .await
                .map_err(Error::Chain)?;
            let block = tipset.block().ok_or_else(|| {
                Error::StateMachineFault(format!("no block at height {height}"))
            })?;
            checkpoint.block_cids.push(block.cid());
            if height == 0 {
                break;
            }
            height -= 1;
        }

        Ok(checkpoint.to_bytes().map_err(Error::from)?)
    }

    /// A checkpoint has agreement: validate its shape, persist it, schedule
    /// it for inclusion, and release the request pool.
    async fn checkpoint(&mut self, stable: StableCheckpoint) -> anyhow::Result<()> {
        let snapshot = Checkpoint::from_bytes(&stable.snapshot.app_data).map_err(Error::from)?;
        snapshot.validate_shape().map_err(Error::from)?;
        debug!(
            validator = %self.id,
            height = snapshot.height.0,
            "engine produced stable checkpoint"
        );

        self.deliver_checkpoint(stable, &snapshot)?;

        // Unblock requests stuck from earlier epochs.
        self.pool.lock().purge();
        metrics().request_pool_size.set(0.0);
        Ok(())
    }

    /// Catch up from a checkpoint after the engine found us out of sync.
    async fn restore_state(&mut self, stable: StableCheckpoint) -> anyhow::Result<()> {
        info!(
            validator = %self.id,
            epoch = stable.epoch().0,
            "restoring state from checkpoint"
        );
        metrics().restore_attempts.inc();

        // A checkpoint from an aborted earlier catch-up must not leak into
        // the blocks we produce after this one.
        self.drain_checkpoint_channel();

        // Overwrite the membership window from the embedded configuration
        // and recompute the pending slot.
        let config = &stable.snapshot.epoch_config;
        self.current_epoch = config.epoch;
        self.memberships = config.memberships.clone();
        let source = EpochNr(config.epoch.0 + self.config_offset);
        if let Some(membership) = self.memberships.get(&source).cloned() {
            self.memberships
                .insert(EpochNr(source.0 + 1), membership);
        }
        self.last_applied = None;

        if stable.snapshot.app_data.is_empty() {
            // Nothing to sync: the engine restarted us from the synthetic
            // genesis checkpoint.
            return Ok(());
        }

        let snapshot = Checkpoint::from_bytes(&stable.snapshot.app_data).map_err(Error::from)?;
        info!(validator = %self.id, height = snapshot.height.0, "restoring chain state");

        self.chain
            .sync_purge_for_recovery(snapshot.height)
            .await
            .map_err(|e| Error::RestoreFailure(format!("purging state: {e}")))?;

        let Some(newest) = snapshot.block_cids.first().copied() else {
            // A checkpoint that certifies no blocks carries nothing to fetch.
            self.deliver_checkpoint(stable, &snapshot)?;
            return Ok(());
        };

        let peers = self
            .chain
            .net_peers()
            .await
            .map_err(|e| Error::RestoreFailure(format!("listing peers: {e}")))?;
        if peers.is_empty() {
            return Err(Error::RestoreFailure(
                "no connection with other peers, cannot sync".into(),
            )
            .into());
        }

        let key = mir_types::TipsetKey::single(newest);
        let mut synced = false;
        for peer in peers {
            debug!(validator = %self.id, %peer, height = snapshot.height.0, "fetching checkpointed tipset");
            match self.chain.sync_fetch_tipset_from_peer(peer, &key).await {
                Ok(tipset) => {
                    self.wait_for_block(tipset.height()).await?;
                    synced = true;
                    break;
                }
                Err(e) => {
                    warn!(validator = %self.id, %peer, error = %e, "peer could not serve checkpointed tipset");
                    continue;
                }
            }
        }
        if !synced {
            return Err(
                Error::RestoreFailure("no peer could serve the checkpointed tipset".into()).into(),
            );
        }

        // Re-deliver the checkpoint so it lands in the next block we
        // produce, exactly as the in-sync validators will do.
        self.deliver_checkpoint(stable, &snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_timeout_scales_with_gap() {
        assert_eq!(
            StateManager::wait_for_block_timeout(0),
            Duration::from_secs(60)
        );
        assert_eq!(
            StateManager::wait_for_block_timeout(30),
            Duration::from_secs(90)
        );
    }
}
