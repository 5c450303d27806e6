//! Durable reconfiguration transaction stream.
//!
//! A crashed validator must resume its configuration requests without
//! re-numbering or skipping them. The manager persists:
//!
//! - `mir/config/next-configuration-number`: number assigned to the next
//!   outbound request, incremented on [`ConfigurationManager::new_tx`];
//! - `mir/config/next-applied-configuration-number`: the lowest-numbered
//!   outstanding request still awaiting agreement;
//! - `mir/config/request/<n>`: the request payloads themselves, kept until
//!   applied so [`ConfigurationManager::pending`] can replay them;
//! - `mir/config/reconfiguration-votes`: the vote records of the current
//!   epoch.

use crate::db::MetadataStore;
use crate::error::Error;
use mir_smr::{NodeId, Request};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NEXT_CONFIGURATION_NUMBER_KEY: &str = "mir/config/next-configuration-number";
pub const NEXT_APPLIED_CONFIGURATION_NUMBER_KEY: &str =
    "mir/config/next-applied-configuration-number";
pub const RECONFIGURATION_VOTES_KEY: &str = "mir/config/reconfiguration-votes";

fn request_key(n: u64) -> String {
    format!("mir/config/request/{n}")
}

/// Votes collected for one proposed validator set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Configuration number of the voted set.
    pub configuration_number: u64,
    /// Content hash of the voted set, in hex.
    pub valset_hash: String,
    /// Distinct voters; a validator cannot move its vote within an epoch.
    pub voted_validators: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VoteRecords {
    pub records: Vec<VoteRecord>,
}

pub struct ConfigurationManager {
    id: NodeId,
    store: Arc<dyn MetadataStore>,
}

impl ConfigurationManager {
    pub fn new(store: Arc<dyn MetadataStore>, id: NodeId) -> Self {
        ConfigurationManager { id, store }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    fn get_number(&self, key: &str) -> Result<u64, Error> {
        match self.store.get(key)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| Error::Codec {
                    key: key.to_string(),
                    reason: format!("expected 8 bytes, got {}", bytes.len()),
                })?;
                Ok(u64::from_le_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn put_number(&self, key: &str, n: u64) -> Result<(), Error> {
        self.store.put(key, &n.to_le_bytes())?;
        Ok(())
    }

    /// Number the next outbound configuration request will carry.
    pub fn next_configuration_number(&self) -> Result<u64, Error> {
        self.get_number(NEXT_CONFIGURATION_NUMBER_KEY)
    }

    /// Lowest-numbered outbound request still awaiting agreement.
    pub fn next_applied_configuration_number(&self) -> Result<u64, Error> {
        self.get_number(NEXT_APPLIED_CONFIGURATION_NUMBER_KEY)
    }

    /// Produce the next configuration request over `payload` and persist the
    /// stream position. The request is stored before the number is bumped,
    /// so a crash between the writes re-issues the same request rather than
    /// skipping a number.
    pub fn new_tx(&self, payload: Vec<u8>) -> Result<Request, Error> {
        let n = self.next_configuration_number()?;
        let request = Request::configuration(self.id.as_str(), n, payload);

        let encoded = serde_json::to_vec(&request).expect("configuration request encoding");
        self.store.put(&request_key(n), &encoded)?;
        self.put_number(NEXT_CONFIGURATION_NUMBER_KEY, n + 1)?;
        Ok(request)
    }

    /// All outstanding requests, in number order, for replay on start.
    pub fn pending(&self) -> Result<Vec<Request>, Error> {
        let applied = self.next_applied_configuration_number()?;
        let next = self.next_configuration_number()?;

        let mut requests = Vec::new();
        for n in applied..next {
            match self.store.get(&request_key(n))? {
                Some(bytes) => {
                    let request: Request =
                        serde_json::from_slice(&bytes).map_err(|e| Error::Codec {
                            key: request_key(n),
                            reason: e.to_string(),
                        })?;
                    requests.push(request);
                }
                // A request can be missing if it was already garbage
                // collected by mark_applied; nothing to replay for it.
                None => continue,
            }
        }
        Ok(requests)
    }

    /// Record that the outbound request numbered `n` has been executed
    /// (its configuration was pushed into the future-epoch slot).
    pub fn mark_applied(&self, n: u64) -> Result<(), Error> {
        let applied = self.next_applied_configuration_number()?;
        if n + 1 > applied {
            self.put_number(NEXT_APPLIED_CONFIGURATION_NUMBER_KEY, n + 1)?;
        }
        for old in applied..=n {
            self.store.delete(&request_key(old))?;
        }
        Ok(())
    }

    /// Persisted vote records; empty when none were stored yet.
    pub fn votes(&self) -> Result<VoteRecords, Error> {
        match self.store.get(RECONFIGURATION_VOTES_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::Codec {
                key: RECONFIGURATION_VOTES_KEY.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(VoteRecords::default()),
        }
    }

    /// Overwrite the persisted vote records with the current epoch's set.
    pub fn put_votes(&self, records: &VoteRecords) -> Result<(), Error> {
        let encoded = serde_json::to_vec(records).expect("vote record encoding");
        self.store.put(RECONFIGURATION_VOTES_KEY, &encoded)?;
        Ok(())
    }
}
