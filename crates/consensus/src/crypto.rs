//! Wallet-backed implementation of the engine's signer contract.

use crate::chain::WalletApi;
use async_trait::async_trait;
use mir_smr::{Crypto, NodeId};
use mir_types::{Address, Signature};
use std::sync::Arc;

/// Signs with this node's wallet key and verifies other validators by
/// resolving their node id back to a chain address. The node id of a
/// validator is the string form of its address, so resolution is a parse.
pub struct WalletCrypto {
    addr: Address,
    wallet: Arc<dyn WalletApi>,
}

impl WalletCrypto {
    pub fn new(addr: Address, wallet: Arc<dyn WalletApi>) -> Self {
        WalletCrypto { addr, wallet }
    }
}

#[async_trait]
impl Crypto for WalletCrypto {
    async fn sign(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let signature = self.wallet.sign(&self.addr, data).await?;
        Ok(serde_json::to_vec(&signature)?)
    }

    async fn verify(&self, node: &NodeId, data: &[u8], sig: &[u8]) -> anyhow::Result<()> {
        let addr: Address = node
            .as_str()
            .parse()
            .map_err(|e| anyhow::anyhow!("node id {node} is not a valid address: {e}"))?;
        let signature: Signature = serde_json::from_slice(sig)?;
        if !self.wallet.verify(&addr, data, &signature).await? {
            anyhow::bail!("invalid signature from {node}");
        }
        Ok(())
    }
}
