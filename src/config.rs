//! Cluster configuration, shared by every process of a deployment.
//!
//! A single JSON file describes the whole cluster; each process picks its own
//! role and tree links out of it by node id.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;

use crate::membership::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Active,
    Passive,
}

/// Position of one node in the failure detection tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLinks {
    #[serde(default)]
    pub parents: Vec<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Authority,
    Replica,
    Relay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// `host:port` per node; RPC over TCP and heartbeats over UDP share the port.
    pub peers: HashMap<NodeId, String>,
    #[serde(default)]
    pub tree: HashMap<NodeId, TreeLinks>,
    pub authority: NodeId,
    pub replicas: Vec<NodeId>,
    pub replication: ReplicationMode,
    #[serde(default)]
    pub initial_data: BTreeMap<String, i64>,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: i64,
    #[serde(default = "default_heartbeat_tolerance")]
    pub heartbeat_tolerance: i64,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: i64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_heartbeat_interval_ms() -> i64 {
    200
}

fn default_heartbeat_tolerance() -> i64 {
    3
}

fn default_checkpoint_interval_ms() -> i64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.peers.contains_key(&self.authority) {
            anyhow::bail!("Authority {} has no address", self.authority);
        }
        if let Some(replica) = self.replicas.iter().find(|r| !self.peers.contains_key(*r)) {
            anyhow::bail!("Replica {} has no address", replica);
        }
        Ok(())
    }

    pub fn role_of(&self, id: &NodeId) -> NodeRole {
        if *id == self.authority {
            NodeRole::Authority
        } else if self.replicas.contains(id) {
            NodeRole::Replica
        } else {
            NodeRole::Relay
        }
    }

    pub fn links(&self, id: &NodeId) -> TreeLinks {
        self.tree.get(id).cloned().unwrap_or_default()
    }

    pub fn peer_addresses(&self) -> Result<HashMap<NodeId, SocketAddr>> {
        self.peers
            .iter()
            .map(|(id, addr)| -> Result<(NodeId, SocketAddr)> {
                let parsed = addr
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid address {:?} for {}", addr, id))?;
                Ok((id.clone(), parsed))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "peers": {
            "authority": "127.0.0.1:7000",
            "r1": "127.0.0.1:7001",
            "r2": "127.0.0.1:7002"
        },
        "tree": {
            "authority": { "children": ["r1", "r2"] },
            "r1": { "parents": ["authority"] },
            "r2": { "parents": ["authority"] }
        },
        "authority": "authority",
        "replicas": ["r1", "r2"],
        "replication": "active",
        "initial_data": { "x": 0 }
    }"#;

    #[test]
    fn test_defaults_apply() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();

        assert_eq!(config.heartbeat_interval_ms, 200);
        assert_eq!(config.heartbeat_tolerance, 3);
        assert_eq!(config.checkpoint_interval_ms, 1000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.replication, ReplicationMode::Active);
        assert_eq!(config.initial_data.get("x"), Some(&0));
    }

    #[test]
    fn test_roles_and_links() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();

        assert_eq!(config.role_of(&NodeId::new("authority")), NodeRole::Authority);
        assert_eq!(config.role_of(&NodeId::new("r2")), NodeRole::Replica);
        assert_eq!(config.role_of(&NodeId::new("detector")), NodeRole::Relay);

        let links = config.links(&NodeId::new("r1"));
        assert_eq!(links.parents, vec![NodeId::new("authority")]);
        assert!(links.children.is_empty());
        assert_eq!(config.links(&NodeId::new("unknown")), TreeLinks::default());
    }

    #[test]
    fn test_peer_addresses() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        let addresses = config.peer_addresses().unwrap();

        assert_eq!(addresses[&NodeId::new("r2")].port(), 7002);
    }

    #[test]
    fn test_replica_without_address_is_rejected() {
        let broken = SAMPLE.replace(r#""replicas": ["r1", "r2"]"#, r#""replicas": ["r1", "r9"]"#);

        assert!(ClusterConfig::from_json(&broken).is_err());
    }
}
