//! Top-level consensus actor: bring-up, main loop, shutdown.
//!
//! The manager resolves the node's identity against the membership source,
//! wires the transport, crypto, state manager, and engine together, and then
//! serves two duties until cancelled: feeding request batches to the engine
//! and turning observed membership changes into configuration requests.
//!
//! Two cancellation contexts are in play. The outer one (owned by the host)
//! governs the manager and all chain I/O; the engine has its own token that
//! is cancelled only during shutdown, after the outer one, so the engine
//! never sees an external cancellation it would interpret as a fault.

use crate::chain::{ChainApi, WalletApi};
use crate::checkpoint_store::CheckpointStore;
use crate::config::{mangler_from_env, recorder_from_env, Config};
use crate::configuration::ConfigurationManager;
use crate::crypto::WalletCrypto;
use crate::db::MetadataStore;
use crate::error::Error;
use crate::metrics::metrics;
use crate::pool::RequestPool;
use crate::state_manager::StateManager;
use mir_membership::MembershipReader;
use mir_smr::{
    batch_channel, BatchRequest, Engine, EngineError, EngineFactory, EngineSetup, EpochNr,
    Membership, NodeId, Request, StableCheckpoint, Transport,
};
use mir_types::{MembershipInfo, SignedMessage, ValidatorSet};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the membership source is compared against the last observed
/// validator set.
pub const RECONFIGURATION_INTERVAL: Duration = Duration::from_millis(2000);

/// Polling cadence while waiting for the initial membership.
pub const READING_MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(3);

/// Upper bound on the initial membership wait. Operators often deploy a
/// validator before joining the subnet; polling beats killing the process
/// and making them restart it after joining.
pub const WAIT_FOR_MEMBERSHIP_TIMEOUT: Duration = Duration::from_secs(600);

const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve membership info and check this node can start under it.
async fn get_membership_info(
    id: &NodeId,
    reader: &dyn MembershipReader,
) -> Result<(MembershipInfo, Membership), Error> {
    let info = reader.membership_info().await?;
    let size = info.validator_set.size();
    if size == 0 {
        return Err(Error::EmptyValidatorSet);
    }
    if info.min_validators > size as u64 {
        return Err(Error::MinValidatorsNotReached {
            have: size,
            need: info.min_validators,
        });
    }
    let membership = info.validator_set.membership();
    if !membership.contains(id) {
        return Err(Error::MissingOwnIdentity);
    }
    Ok((info, membership))
}

/// Poll the membership source until it returns a set this node can start
/// with, or the timeout elapses. Missing identity and a too-small committee
/// keep the poll going; any other error aborts.
pub async fn wait_for_membership_info(
    id: &NodeId,
    reader: &dyn MembershipReader,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(MembershipInfo, Membership), Error> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut next = tokio::time::interval(READING_MEMBERSHIP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = &mut deadline => return Err(Error::MembershipTimeout),
            _ = next.tick() => {
                info!(validator = %id, "attempting to retrieve membership information");
                match get_membership_info(id, reader).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.is_retriable_membership() => {
                        info!(validator = %id, reason = %e, "membership not ready yet");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

pub struct Manager {
    id: NodeId,
    net_name: String,
    chain: Arc<dyn ChainApi>,
    membership: Arc<dyn MembershipReader>,
    transport: Arc<dyn Transport>,
    pool: Arc<Mutex<RequestPool>>,
    config_manager: Arc<ConfigurationManager>,
    initial_validator_set: ValidatorSet,
    max_transactions_in_batch: usize,

    cancel: CancellationToken,
    engine_cancel: CancellationToken,
    engine: Option<Box<dyn Engine>>,
    batch_rx: mpsc::Receiver<BatchRequest>,
    stopped: bool,
}

impl Manager {
    /// Bring the validator up: resolve identity and membership, start the
    /// transport, seed the state manager from the persisted (or genesis)
    /// checkpoint, and build the engine. The engine does not run until
    /// [`Manager::serve`].
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn WalletApi>,
        store: Arc<dyn MetadataStore>,
        membership: Arc<dyn MembershipReader>,
        transport: Arc<dyn Transport>,
        engine_factory: Arc<dyn EngineFactory>,
        cfg: Config,
        cancel: CancellationToken,
    ) -> Result<Manager, Error> {
        cfg.validate()?;
        let id = cfg.node_id();

        let net_name = chain.state_network_name().await.map_err(Error::Chain)?;

        let (info, initial_membership) = wait_for_membership_info(
            &id,
            membership.as_ref(),
            WAIT_FOR_MEMBERSHIP_TIMEOUT,
            &cancel,
        )
        .await?;
        let genesis_epoch = EpochNr(info.genesis_epoch);
        let initial_validator_set = info.validator_set.clone();

        transport
            .start()
            .map_err(|e| Error::Config(format!("failed to start transport: {e}")))?;
        transport.connect(&initial_membership);

        let crypto = Arc::new(WalletCrypto::new(cfg.addr.clone(), wallet));
        let config_manager = Arc::new(ConfigurationManager::new(store.clone(), id.clone()));
        let pool = Arc::new(Mutex::new(RequestPool::new()));
        let checkpoints = CheckpointStore::new(store);

        let state_manager = StateManager::new(
            id.clone(),
            initial_membership.clone(),
            genesis_epoch,
            chain.clone(),
            checkpoints.clone(),
            config_manager.clone(),
            pool.clone(),
            cancel.clone(),
            cfg.consensus.config_offset,
            cfg.consensus.segment_length,
            cfg.checkpoint_repo.clone(),
        )
        .await?;

        let initial_checkpoint = match cfg.initial_checkpoint.clone() {
            Some(checkpoint) => checkpoint,
            None => Self::initial_checkpoint(
                &chain,
                &checkpoints,
                initial_membership,
                cfg.consensus.config_offset,
                genesis_epoch,
            )
            .await?,
        };

        let mangler = mangler_from_env()?;
        let recorder = recorder_from_env(&cfg.group_name, &id);
        if let Some(rec) = &recorder {
            info!(validator = %id, dir = %rec.dir.display(), "event-log recorder enabled");
        }

        let (fetcher, batch_rx) = batch_channel();
        let engine_cancel = CancellationToken::new();
        let engine = engine_factory.build(EngineSetup {
            id: id.clone(),
            transport: transport.clone(),
            crypto,
            app: Box::new(state_manager),
            initial_checkpoint,
            params: cfg.smr_params(),
            fetcher,
            cancel: engine_cancel.clone(),
            mangler,
            recorder,
        })?;

        Ok(Manager {
            id,
            net_name,
            chain,
            membership,
            transport,
            pool,
            config_manager,
            initial_validator_set,
            max_transactions_in_batch: cfg.consensus.max_transactions_in_batch,
            cancel,
            engine_cancel,
            engine: Some(engine),
            batch_rx,
            stopped: false,
        })
    }

    /// The engine's starting point: the persisted stable checkpoint if there
    /// is one, otherwise a synthetic genesis checkpoint wrapping the latest
    /// (or genesis) application snapshot.
    async fn initial_checkpoint(
        chain: &Arc<dyn ChainApi>,
        checkpoints: &CheckpointStore,
        membership: Membership,
        config_offset: u64,
        genesis_epoch: EpochNr,
    ) -> Result<StableCheckpoint, Error> {
        if let Some(stable) = checkpoints.latest_stable()? {
            return Ok(stable);
        }
        let genesis = chain.chain_get_genesis().await.map_err(Error::Chain)?;
        let genesis_cid = genesis
            .block()
            .ok_or_else(|| Error::StateMachineFault("genesis tipset has no block".into()))?
            .cid();
        let snapshot = checkpoints.latest_or_genesis(genesis_cid)?;
        Ok(StableCheckpoint::genesis(
            snapshot.to_bytes()?,
            membership,
            config_offset,
            genesis_epoch,
        ))
    }

    /// Run the main loop until the outer context is cancelled or the engine
    /// dies. An engine failure is fatal: consensus cannot make safe progress
    /// without it, and the error surfaces so the process exits.
    pub async fn serve(mut self) -> Result<(), Error> {
        info!(
            validator = %self.id,
            network = %self.net_name,
            validators = self.initial_validator_set.size(),
            "mir manager serve started"
        );

        let engine = self
            .engine
            .take()
            .ok_or_else(|| Error::Config("manager already served".into()))?;
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(1);
        tokio::spawn(async move {
            // The engine gets its own cancellation scope; if the outer
            // context closes first, the error we receive here cannot be a
            // plain stop.
            let _ = err_tx.send(engine.run().await).await;
        });

        let mut reconfigure = tokio::time::interval(RECONFIGURATION_INTERVAL);
        reconfigure.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut config_requests = self.config_manager.pending()?;
        if !config_requests.is_empty() {
            info!(
                validator = %self.id,
                count = config_requests.len(),
                "replaying pending configuration requests"
            );
        }
        let mut last_validator_set = self.initial_validator_set.clone();

        let mut engine_terminated = false;
        let result = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(validator = %self.id, "mir manager: context closed");
                    break Ok(());
                }

                Some(err) = err_rx.recv() => {
                    engine_terminated = true;
                    error!(validator = %self.id, error = %err, "engine terminated unexpectedly");
                    break Err(Error::Engine(err));
                }

                _ = reconfigure.tick() => {
                    self.reconfiguration_tick(&mut last_validator_set, &mut config_requests).await;
                }

                Some(request) = self.batch_rx.recv() => {
                    self.serve_batch_request(request, &mut config_requests).await;
                }
            }
        };

        self.stop(&mut err_rx, engine_terminated).await;
        result
    }

    /// Compare the membership source against the last observed set and turn
    /// a change into a persisted configuration request. Source errors are
    /// transient: log and retry at the next tick.
    async fn reconfiguration_tick(
        &self,
        last_validator_set: &mut ValidatorSet,
        config_requests: &mut Vec<Request>,
    ) {
        let info = match self.membership.membership_info().await {
            Ok(info) => info,
            Err(e) => {
                warn!(validator = %self.id, error = %e, "failed to get subnet validators");
                metrics().membership_poll_failures.inc();
                return;
            }
        };
        let new_set = info.validator_set;
        if *last_validator_set == new_set {
            return;
        }

        info!(
            validator = %self.id,
            configuration = new_set.configuration_number,
            size = new_set.size(),
            "observed new validator set"
        );
        *last_validator_set = new_set.clone();

        let payload = match new_set.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(validator = %self.id, error = %e, "unable to serialize validator set");
                return;
            }
        };
        match self.config_manager.new_tx(payload) {
            Ok(request) => {
                metrics().reconfiguration_requests_sent.inc();
                config_requests.push(request);
            }
            Err(e) => {
                error!(validator = %self.id, error = %e, "unable to create configuration tx");
            }
        }
    }

    /// Answer one batch pull: mempool messages wrapped as transport
    /// requests, with all still-pending configuration requests appended.
    /// Host errors only cost this pull; the engine retries on its cadence.
    async fn serve_batch_request(
        &mut self,
        request: BatchRequest,
        config_requests: &mut Vec<Request>,
    ) {
        // Requests whose configuration has been executed no longer need
        // re-proposing.
        match self.config_manager.next_applied_configuration_number() {
            Ok(applied) => config_requests.retain(|r| r.req_no >= applied),
            Err(e) => warn!(validator = %self.id, error = %e, "reading applied watermark"),
        }

        let base = match self.chain.chain_head().await {
            Ok(base) => base,
            Err(e) => {
                warn!(validator = %self.id, error = %e, "failed to get chain head");
                request.respond(Vec::new());
                return;
            }
        };

        debug!(validator = %self.id, height = base.height().0, "selecting messages from mempool");
        let messages = match self
            .chain
            .mpool_select(&base.key(), self.max_transactions_in_batch)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                error!(
                    validator = %self.id,
                    height = base.height().0,
                    error = %e,
                    "failed to select messages from mempool"
                );
                Vec::new()
            }
        };

        let mut requests = self.batch_signed_messages(messages);
        requests.extend(config_requests.iter().cloned());
        request.respond(requests);
    }

    /// Wrap mempool messages as transport requests, skipping anything the
    /// request pool already has in flight.
    fn batch_signed_messages(&self, messages: Vec<SignedMessage>) -> Vec<Request> {
        let mut pool = self.pool.lock();
        let mut requests = Vec::new();
        for msg in messages {
            let client_id = msg.message.from.to_string();
            let nonce = msg.message.nonce;
            if !pool.is_target(&client_id, nonce) {
                debug!(
                    validator = %self.id,
                    client = %client_id,
                    nonce,
                    "skipping message already in flight"
                );
                continue;
            }
            let data = match msg.to_bytes() {
                Ok(data) => data,
                Err(e) => {
                    error!(validator = %self.id, error = %e, "serializing signed message");
                    continue;
                }
            };
            pool.add(msg.cid(), &client_id, nonce);
            requests.push(Request::transport(client_id, nonce, data));
        }
        metrics().request_pool_size.set(pool.len() as f64);
        requests
    }

    /// Stop the manager and all its components. Idempotent. The engine's
    /// context is cancelled here, strictly after the outer one.
    async fn stop(&mut self, err_rx: &mut mpsc::Receiver<EngineError>, engine_terminated: bool) {
        if self.stopped {
            warn!(validator = %self.id, "mir manager has already been stopped");
            return;
        }
        self.stopped = true;
        info!(validator = %self.id, "mir manager stop started");

        self.engine_cancel.cancel();
        self.transport.stop();
        info!(validator = %self.id, "network transport stopped");

        if !engine_terminated {
            match tokio::time::timeout(ENGINE_STOP_TIMEOUT, err_rx.recv()).await {
                Ok(Some(EngineError::Stopped)) => {
                    info!(validator = %self.id, "engine stopped");
                }
                Ok(Some(err)) => {
                    error!(validator = %self.id, error = %err, "engine stopped with error");
                }
                Ok(None) => {
                    warn!(validator = %self.id, "engine exited without reporting");
                }
                Err(_) => {
                    error!(validator = %self.id, "timed out waiting for the engine to stop");
                }
            }
        }
        info!(validator = %self.id, "mir manager stop finished");
    }
}
