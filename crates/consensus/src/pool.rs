//! FIFO pool of in-flight client transactions.
//!
//! The pool keeps the engine from being handed the same transaction twice:
//! once a message is proposed it stays keyed by `(client, nonce)` until it
//! is committed or the pool is purged at a checkpoint. It also remembers the
//! message cid per request as a tracking hook.

use mir_types::Cid;
use std::collections::{HashMap, VecDeque};

#[derive(Default)]
pub struct RequestPool {
    /// In-flight requests keyed by (client id, nonce).
    in_flight: HashMap<(String, u64), Cid>,
    /// Next expected nonce per client, advanced on every add.
    next_nonce: HashMap<String, u64>,
    /// Insertion order, for observability only.
    order: VecDeque<(String, u64)>,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `(client, nonce)` is the next request the pool expects from
    /// this client and is not already in flight.
    pub fn is_target(&self, client: &str, nonce: u64) -> bool {
        if self.in_flight.contains_key(&(client.to_string(), nonce)) {
            return false;
        }
        match self.next_nonce.get(client) {
            Some(&next) => nonce == next,
            None => true,
        }
    }

    /// Record a request as in flight.
    pub fn add(&mut self, msg_cid: Cid, client: &str, nonce: u64) {
        let key = (client.to_string(), nonce);
        if self.in_flight.insert(key.clone(), msg_cid).is_none() {
            self.order.push_back(key);
        }
        self.next_nonce.insert(client.to_string(), nonce + 1);
    }

    /// Cancel a request once its transaction is committed. Returns the
    /// message cid it was tracked under.
    pub fn remove(&mut self, client: &str, nonce: u64) -> Option<Cid> {
        let key = (client.to_string(), nonce);
        let cid = self.in_flight.remove(&key);
        if cid.is_some() {
            self.order.retain(|k| k != &key);
        }
        cid
    }

    /// Drop every entry. Called between checkpoints so that requests from
    /// earlier epochs cannot stay stuck.
    pub fn purge(&mut self) {
        self.in_flight.clear();
        self.next_nonce.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
