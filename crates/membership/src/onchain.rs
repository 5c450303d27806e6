//! On-chain membership through the ipc agent's JSON-RPC interface.

use crate::{MembershipError, MembershipReader};
use async_trait::async_trait;
use mir_types::{MembershipInfo, ValidatorSet};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const QUERY_VALIDATOR_SET_METHOD: &str = "ipc_queryValidatorSet";

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: QueryValidatorSetParams<'a>,
}

#[derive(Serialize)]
struct QueryValidatorSetParams<'a> {
    subnet: &'a str,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<AgentResponse>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Payload returned by the agent for `ipc_queryValidatorSet`.
#[derive(Deserialize)]
struct AgentResponse {
    validator_set: ValidatorSet,
    #[serde(default)]
    min_validators: u64,
    #[serde(default)]
    genesis_epoch: u64,
}

/// Validator set read from the subnet actor via an external ipc agent.
pub struct OnChainMembership {
    client: reqwest::Client,
    endpoint: String,
    subnet: String,
}

impl OnChainMembership {
    pub fn new(endpoint: impl Into<String>, subnet: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        OnChainMembership {
            client,
            endpoint: endpoint.into(),
            subnet: subnet.into(),
        }
    }
}

#[async_trait]
impl MembershipReader for OnChainMembership {
    async fn membership_info(&self) -> Result<MembershipInfo, MembershipError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: QUERY_VALIDATOR_SET_METHOD,
            params: QueryValidatorSetParams {
                subnet: &self.subnet,
            },
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| MembershipError::Rpc(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MembershipError::Rpc(format!(
                "{QUERY_VALIDATOR_SET_METHOD} failed: {status} {body}"
            )));
        }

        let rpc: RpcResponse = resp
            .json()
            .await
            .map_err(|e| MembershipError::Rpc(e.to_string()))?;
        if let Some(err) = rpc.error {
            return Err(MembershipError::Rpc(format!(
                "{QUERY_VALIDATOR_SET_METHOD} error {}: {}",
                err.code, err.message
            )));
        }
        let result = rpc
            .result
            .ok_or_else(|| MembershipError::Rpc("response carries no result".to_string()))?;

        Ok(MembershipInfo {
            validator_set: result.validator_set,
            min_validators: result.min_validators,
            genesis_epoch: result.genesis_epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_response_decodes() {
        let raw = r#"{
            "result": {
                "validator_set": {
                    "configuration_number": 2,
                    "validators": [
                        "t1val0@/ip4/127.0.0.1/tcp/10000",
                        "t1val1@/ip4/127.0.0.1/tcp/10001"
                    ]
                },
                "min_validators": 4,
                "genesis_epoch": 100
            }
        }"#;
        let resp: RpcResponse = serde_json::from_str(raw).unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result.validator_set.size(), 2);
        assert_eq!(result.validator_set.configuration_number, 2);
        assert_eq!(result.min_validators, 4);
        assert_eq!(result.genesis_epoch, 100);
    }

    #[test]
    fn rpc_error_decodes() {
        let raw = r#"{"error": {"code": -32000, "message": "subnet not found"}}"#;
        let resp: RpcResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32000);
    }
}
