use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a process in the cluster, stable for the lifetime of the process.
///
/// Ids of the authority, detectors and replicas come from configuration;
/// clients may generate a random one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

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
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Liveness transition of a node observed somewhere in the detection tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LivenessEvent {
    Alive(NodeId),
    Dead(NodeId),
}

impl LivenessEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            LivenessEvent::Alive(node) | LivenessEvent::Dead(node) => node,
        }
    }
}

/// Unreliable datagrams exchanged between detectors.
///
/// - `Heartbeat`: pushed from a child to each of its parents once per interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Datagram {
    Heartbeat { from: NodeId },
}

impl Datagram {
    pub fn sender(&self) -> &NodeId {
        match self {
            Datagram::Heartbeat { from } => from,
        }
    }
}
