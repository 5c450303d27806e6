//! The opaque-engine seam.
//!
//! The adapter never links the engine directly: it hands an
//! [`EngineFactory`] everything the engine needs (transport, crypto,
//! application logic, initial checkpoint, parameters, batch fetcher) and gets
//! back a running [`Engine`] plus a terminal error when it stops.

use crate::{AppLogic, Membership, NodeId, Request, SmrParams, StableCheckpoint};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Terminal engine outcome.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine observed its cancellation token; an orderly stop.
    #[error("engine stopped")]
    Stopped,
    /// The application logic returned an error; the engine cannot continue.
    #[error("application logic failed: {0}")]
    App(String),
    /// Anything else inside the engine (transport, agreement, storage).
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Message transport driven by the engine.
///
/// The adapter starts the transport before the engine and stops it exactly
/// once during shutdown.
pub trait Transport: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    /// (Re)connect to the given membership's network addresses.
    fn connect(&self, membership: &Membership);
    fn stop(&self);
}

/// The engine's signer contract.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Sign `data` with this node's identity.
    async fn sign(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;
    /// Verify a signature made by `node` over `data`.
    async fn verify(&self, node: &NodeId, data: &[u8], sig: &[u8]) -> anyhow::Result<()>;
}

/// One batch pull from the engine. The adapter replies exactly once.
#[derive(Debug)]
pub struct BatchRequest {
    reply: oneshot::Sender<Vec<Request>>,
}

impl BatchRequest {
    /// Answer the pull with the next batch of requests.
    pub fn respond(self, requests: Vec<Request>) {
        // The engine may have been cancelled between asking and the reply;
        // a dropped receiver is not an error.
        let _ = self.reply.send(requests);
    }
}

/// Engine-held side of the batch pull channel.
///
/// Strictly request/response: the engine never has two outstanding pulls.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    tx: mpsc::Sender<BatchRequest>,
}

impl BatchFetcher {
    /// Ask the adapter for the next batch. Returns `None` when the adapter
    /// side is gone (shutdown).
    pub async fn fetch(&self) -> Option<Vec<Request>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BatchRequest { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Create the batch pull channel pair: the fetcher goes to the engine, the
/// receiver stays with the adapter's main loop.
pub fn batch_channel() -> (BatchFetcher, mpsc::Receiver<BatchRequest>) {
    let (tx, rx) = mpsc::channel(1);
    (BatchFetcher { tx }, rx)
}

/// Message perturbation parameters for fault-injection testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManglerParams {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Drop rate in percent, 0..=100.
    pub drop_rate: u64,
}

/// Event-log recorder destination, enabled through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Directory the recorder writes under: `<output>/<group>/<node id>`.
    pub dir: PathBuf,
}

/// Everything an [`EngineFactory`] needs to assemble an engine.
pub struct EngineSetup {
    pub id: NodeId,
    pub transport: Arc<dyn Transport>,
    pub crypto: Arc<dyn Crypto>,
    pub app: Box<dyn AppLogic>,
    pub initial_checkpoint: StableCheckpoint,
    pub params: SmrParams,
    pub fetcher: BatchFetcher,
    /// Cancelled by the adapter during shutdown, strictly after the outer
    /// host context. The engine must return [`EngineError::Stopped`].
    pub cancel: CancellationToken,
    /// When set, wrap the engine's transport in a delay/drop layer.
    pub mangler: Option<ManglerParams>,
    /// When set, record the engine event log under the given directory.
    pub recorder: Option<RecorderConfig>,
}

/// Builds engines. Implemented outside this workspace by the real BFT engine
/// and inside the test harness by a deterministic stand-in.
pub trait EngineFactory: Send + Sync {
    fn build(&self, setup: EngineSetup) -> Result<Box<dyn Engine>, EngineError>;
}

/// A running engine instance.
#[async_trait]
pub trait Engine: Send {
    /// Drive the engine until it stops. Returns [`EngineError::Stopped`] on
    /// orderly cancellation, any other variant on fatal failure.
    async fn run(self: Box<Self>) -> EngineError;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_pull_is_request_response() {
        let (fetcher, mut rx) = batch_channel();

        let server = tokio::spawn(async move {
            let req = rx.recv().await.expect("pull arrives");
            req.respond(vec![Request::transport("t1abc", 0, vec![])]);
        });

        let batch = fetcher.fetch().await.expect("reply arrives");
        assert_eq!(batch.len(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_returns_none_after_adapter_drops() {
        let (fetcher, rx) = batch_channel();
        drop(rx);
        assert!(fetcher.fetch().await.is_none());
    }
}
