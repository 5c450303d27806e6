//! Node identities and epoch memberships as the engine sees them.

use libp2p::Multiaddr;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Engine-side node identifier.
///
/// The string form of the validator's chain address doubles as its engine
/// node id, which is how the adapter maps between the two worlds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Ordered map from node id to its transport address.
///
/// Iteration order is deterministic (lexicographic by node id) so that every
/// validator derives the same membership hash and the engine sees identical
/// configurations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    nodes: BTreeMap<NodeId, Multiaddr>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId, addr: Multiaddr) {
        self.nodes.insert(id, addr);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn addr(&self, id: &NodeId) -> Option<&Multiaddr> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Multiaddr)> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }
}

impl FromIterator<(NodeId, Multiaddr)> for Membership {
    fn from_iter<T: IntoIterator<Item = (NodeId, Multiaddr)>>(iter: T) -> Self {
        Membership {
            nodes: iter.into_iter().collect(),
        }
    }
}

// Multiaddr is serialized through its canonical string form so that persisted
// memberships stay readable and independent of the multiaddr wire encoding.
impl Serialize for Membership {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let as_strings: BTreeMap<&str, String> = self
            .nodes
            .iter()
            .map(|(id, addr)| (id.as_str(), addr.to_string()))
            .collect();
        as_strings.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Membership {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let as_strings = BTreeMap::<String, String>::deserialize(deserializer)?;
        let mut nodes = BTreeMap::new();
        for (id, addr) in as_strings {
            let addr = addr
                .parse::<Multiaddr>()
                .map_err(|e| D::Error::custom(format!("invalid multiaddr {addr}: {e}")))?;
            nodes.insert(NodeId(id), addr);
        }
        Ok(Membership { nodes })
    }
}
