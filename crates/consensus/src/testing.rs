//! In-process test doubles: a mock chain node, a deterministic wallet, and
//! a deterministic engine that drives the application contract the way the
//! real engine does, minus agreement.

use crate::chain::{ChainApi, WalletApi};
use async_trait::async_trait;
use libp2p::PeerId;
use mir_smr::{
    Certificate, Engine, EngineError, EngineFactory, EngineSetup, EpochNr, Snapshot,
    StableCheckpoint, Transport,
};
use mir_types::{
    Address, Block, BlockHeader, BlockTemplate, Cid, Height, Message, Signature, SignatureKind,
    SignedMessage, Tipset, TipsetKey, Validator, ValidatorSet,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Fixtures ────────────────────────────────────────────────────────────

pub fn test_validator(i: usize) -> Validator {
    format!("t1val{i}@/ip4/127.0.0.1/tcp/{}", 10000 + i)
        .parse()
        .unwrap()
}

pub fn test_validator_set(n: usize, configuration_number: u64) -> ValidatorSet {
    ValidatorSet::new(configuration_number, (0..n).map(test_validator).collect()).unwrap()
}

pub fn test_message(from: &Address, nonce: u64) -> SignedMessage {
    let message = Message {
        from: from.clone(),
        to: "t1recipient".parse().unwrap(),
        nonce,
        params: vec![0xca, 0xfe],
    };
    let payload = serde_json::to_vec(&message).unwrap();
    SignedMessage {
        signature: fake_signature(from, &payload),
        message,
    }
}

/// The deterministic signature scheme shared by [`MemoryWallet`] and the
/// certificates the deterministic engine emits.
pub fn fake_signature(addr: &Address, data: &[u8]) -> Signature {
    let mut bytes = addr.to_string().into_bytes();
    bytes.extend_from_slice(data);
    Signature::new(SignatureKind::Delegated, Cid::of(&bytes).as_bytes().to_vec())
}

/// A certificate over `data` signed by every listed validator, in the
/// serialized-signature form the adapter's verification expects.
pub fn fake_certificate(signers: &[Address], data: &[u8]) -> Certificate {
    let mut cert = Certificate::default();
    for addr in signers {
        let sig = fake_signature(addr, data);
        cert.signatures.insert(
            mir_smr::NodeId(addr.to_string()),
            serde_json::to_vec(&sig).unwrap(),
        );
    }
    cert
}

// ── Wallet ──────────────────────────────────────────────────────────────

/// Wallet whose signatures are content hashes; verification recomputes.
#[derive(Default)]
pub struct MemoryWallet;

#[async_trait]
impl WalletApi for MemoryWallet {
    async fn sign(&self, addr: &Address, data: &[u8]) -> anyhow::Result<Signature> {
        Ok(fake_signature(addr, data))
    }

    async fn verify(
        &self,
        addr: &Address,
        data: &[u8],
        signature: &Signature,
    ) -> anyhow::Result<bool> {
        Ok(*signature == fake_signature(addr, data))
    }
}

// ── Transport ───────────────────────────────────────────────────────────

/// Transport that only counts lifecycle calls.
#[derive(Default)]
pub struct NullTransport {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn times_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn times_stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Transport for NullTransport {
    fn start(&self) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect(&self, _membership: &mir_smr::Membership) {}

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Mock chain ──────────────────────────────────────────────────────────

struct ChainState {
    blocks: Vec<Block>,
    mempool: Vec<SignedMessage>,
}

/// In-memory single-branch chain implementing the adapter's host seam.
///
/// Every instance starts from the same deterministic genesis block, so
/// independent "nodes" built from separate instances share a genesis cid.
pub struct MockChain {
    state: Mutex<ChainState>,
    peers: Mutex<HashMap<PeerId, Arc<MockChain>>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = Block {
            header: BlockHeader {
                miner: Address::system_actor(),
                parents: vec![Cid::ZERO],
                height: Height(0),
                timestamp: 0,
                win_count: 0,
                ticket: None,
                election_proof: None,
                parent_weight: 0,
                parent_state_root: Cid::of(b"genesis-state"),
                block_sig: None,
                bls_aggregate: Some(Signature::new(SignatureKind::Bls, Vec::new())),
            },
            messages: Vec::new(),
        };
        MockChain {
            state: Mutex::new(ChainState {
                blocks: vec![genesis],
                mempool: Vec::new(),
            }),
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn push_message(&self, msg: SignedMessage) {
        self.state.lock().mempool.push(msg);
    }

    pub fn height(&self) -> Height {
        let state = self.state.lock();
        state.blocks.last().expect("genesis always present").header.height
    }

    pub fn block_at(&self, height: Height) -> Option<Block> {
        self.state.lock().blocks.get(height.0 as usize).cloned()
    }

    pub fn add_peer(&self, peer: PeerId, chain: Arc<MockChain>) {
        self.peers.lock().insert(peer, chain);
    }

    fn included(state: &ChainState, msg: &SignedMessage) -> bool {
        state.blocks.iter().any(|b| {
            b.messages
                .iter()
                .any(|m| m.message.from == msg.message.from && m.message.nonce == msg.message.nonce)
        })
    }
}

#[async_trait]
impl ChainApi for MockChain {
    async fn state_network_name(&self) -> anyhow::Result<String> {
        Ok("mir-testnet".to_string())
    }

    async fn chain_head(&self) -> anyhow::Result<Tipset> {
        let state = self.state.lock();
        let head = state.blocks.last().expect("genesis always present");
        Ok(Tipset::new(vec![head.header.clone()]))
    }

    async fn chain_get_genesis(&self) -> anyhow::Result<Tipset> {
        let state = self.state.lock();
        Ok(Tipset::new(vec![state.blocks[0].header.clone()]))
    }

    async fn chain_get_tipset_by_height(&self, height: Height) -> anyhow::Result<Tipset> {
        let state = self.state.lock();
        let block = state
            .blocks
            .get(height.0 as usize)
            .ok_or_else(|| anyhow::anyhow!("no tipset at height {height}"))?;
        Ok(Tipset::new(vec![block.header.clone()]))
    }

    async fn mpool_select(
        &self,
        _base: &TipsetKey,
        max: usize,
    ) -> anyhow::Result<Vec<SignedMessage>> {
        let state = self.state.lock();
        Ok(state
            .mempool
            .iter()
            .filter(|m| !Self::included(&state, m))
            .take(max)
            .cloned()
            .collect())
    }

    async fn miner_create_block(&self, template: BlockTemplate) -> anyhow::Result<Option<Block>> {
        let state = self.state.lock();
        let parent_cid = template
            .parents
            .0
            .first()
            .ok_or_else(|| anyhow::anyhow!("block template without parents"))?;
        let parent = state
            .blocks
            .iter()
            .find(|b| b.header.cid() == *parent_cid)
            .ok_or_else(|| anyhow::anyhow!("unknown parent {parent_cid}"))?;

        let header = BlockHeader {
            miner: template.miner,
            parents: template.parents.0.clone(),
            height: template.height,
            timestamp: template.timestamp,
            win_count: 0,
            ticket: template.ticket,
            election_proof: template.election_proof,
            parent_weight: parent.header.height.0 + 1,
            parent_state_root: Cid::of(format!("state-{}", template.height).as_bytes()),
            block_sig: None,
            bls_aggregate: Some(Signature::new(SignatureKind::Bls, Vec::new())),
        };
        Ok(Some(Block {
            header,
            messages: template.messages,
        }))
    }

    async fn sync_submit_block(&self, block: Block) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let next = state.blocks.len() as u64;
        match block.header.height.0 {
            h if h == next => {
                state.blocks.push(block);
                Ok(())
            }
            h if h < next => {
                // Re-submitting an existing block is idempotent; a
                // different block at an existing height is a fork.
                if state.blocks[h as usize].header.cid() == block.header.cid() {
                    Ok(())
                } else {
                    anyhow::bail!("conflicting block at height {h}")
                }
            }
            h => anyhow::bail!("block at height {h} skips ahead of head {}", next - 1),
        }
    }

    async fn sync_purge_for_recovery(&self, keep: Height) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.blocks.truncate(keep.0 as usize + 1);
        Ok(())
    }

    async fn net_peers(&self) -> anyhow::Result<Vec<PeerId>> {
        Ok(self.peers.lock().keys().copied().collect())
    }

    async fn sync_fetch_tipset_from_peer(
        &self,
        peer: PeerId,
        key: &TipsetKey,
    ) -> anyhow::Result<Tipset> {
        let chain = self
            .peers
            .lock()
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown peer {peer}"))?;
        let wanted = key
            .0
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty tipset key"))?;

        let remote = chain.state.lock();
        let target = remote
            .blocks
            .iter()
            .find(|b| b.header.cid() == *wanted)
            .ok_or_else(|| anyhow::anyhow!("peer {peer} does not have {wanted}"))?
            .clone();

        // Feed the fetched range to the local "syncer".
        let mut state = self.state.lock();
        let from = state.blocks.len();
        let to = target.header.height.0 as usize;
        if from <= to {
            for block in remote.blocks[from..=to].iter() {
                state.blocks.push(block.clone());
            }
        }
        Ok(Tipset::new(vec![target.header]))
    }
}

// ── Deterministic engine ────────────────────────────────────────────────

/// Builds [`DeterministicEngine`]s: a stand-in that exercises the
/// application contract in order (batches, snapshots, checkpoints, epochs)
/// without running agreement.
pub struct DeterministicEngineFactory {
    /// Number of batches to apply before idling until cancellation.
    pub batches: u64,
    /// Apply a checkpoint (snapshot → checkpoint → new epoch) every this
    /// many batches; 0 disables checkpointing.
    pub checkpoint_period: u64,
    /// Validators whose signatures appear on produced certificates.
    pub signers: Vec<Address>,
}

impl EngineFactory for DeterministicEngineFactory {
    fn build(&self, setup: EngineSetup) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(DeterministicEngine {
            setup,
            batches: self.batches,
            checkpoint_period: self.checkpoint_period,
            signers: self.signers.clone(),
        }))
    }
}

pub struct DeterministicEngine {
    setup: EngineSetup,
    batches: u64,
    checkpoint_period: u64,
    signers: Vec<Address>,
}

#[async_trait]
impl Engine for DeterministicEngine {
    async fn run(self: Box<Self>) -> EngineError {
        let mut this = *self;
        let app = &mut this.setup.app;
        let mut epoch_config = this.setup.initial_checkpoint.snapshot.epoch_config.clone();
        let config_offset = this.setup.params.config_offset;

        let mut applied = 0u64;
        while applied < this.batches {
            // Propose on the configured cadence, like the real engine.
            tokio::select! {
                _ = this.setup.cancel.cancelled() => return EngineError::Stopped,
                _ = tokio::time::sleep(this.setup.params.max_propose_delay) => {}
            }
            let batch = tokio::select! {
                _ = this.setup.cancel.cancelled() => return EngineError::Stopped,
                batch = this.setup.fetcher.fetch() => match batch {
                    Some(batch) => batch,
                    None => return EngineError::Stopped,
                },
            };
            if let Err(e) = app.apply_txs(batch).await {
                return EngineError::App(e.to_string());
            }
            applied += 1;

            if this.checkpoint_period > 0 && applied % this.checkpoint_period == 0 {
                let app_data = match app.snapshot().await {
                    Ok(data) => data,
                    Err(e) => return EngineError::App(e.to_string()),
                };
                let cert = fake_certificate(&this.signers, &app_data);
                let stable = StableCheckpoint {
                    sn: applied,
                    snapshot: Snapshot {
                        app_data,
                        epoch_config: epoch_config.clone(),
                    },
                    cert,
                };
                if let Err(e) = app.checkpoint(stable).await {
                    return EngineError::App(e.to_string());
                }

                let next = epoch_config.epoch.next();
                match app.new_epoch(next).await {
                    Ok(membership) => {
                        epoch_config.epoch = next;
                        epoch_config
                            .memberships
                            .insert(EpochNr(next.0 + config_offset + 1), membership);
                        epoch_config
                            .memberships
                            .retain(|epoch, _| epoch.0 + 1 >= next.0);
                    }
                    Err(e) => return EngineError::App(e.to_string()),
                }
            }
        }

        this.setup.cancel.cancelled().await;
        EngineError::Stopped
    }
}
