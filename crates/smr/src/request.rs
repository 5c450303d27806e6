//! The wire-level unit fed to the SMR engine.

use serde::{Deserialize, Serialize};

/// Kind of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Carries a serialized signed chain message.
    /// Key: `(client_id = sender address, req_no = nonce)`.
    Transport,
    /// Carries a serialized validator set.
    /// Key: `(client_id = validator id, req_no = next configuration number)`.
    Configuration,
}

/// A request submitted to the engine for total ordering.
///
/// The engine treats `data` as opaque bytes; deduplication and replay
/// protection are keyed on `(client_id, req_no)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: String,
    pub req_no: u64,
    pub kind: RequestKind,
    pub data: Vec<u8>,
}

impl Request {
    pub fn transport(client_id: impl Into<String>, req_no: u64, data: Vec<u8>) -> Self {
        Request {
            client_id: client_id.into(),
            req_no,
            kind: RequestKind::Transport,
            data,
        }
    }

    pub fn configuration(client_id: impl Into<String>, req_no: u64, data: Vec<u8>) -> Self {
        Request {
            client_id: client_id.into(),
            req_no,
            kind: RequestKind::Configuration,
            data,
        }
    }
}
