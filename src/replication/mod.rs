//! Replication Module
//!
//! Keeps the key-counter store consistent across the members of the current membership.
//!
//! ## Core Concepts
//! - **ReplicaCore**: Store, checkpoint and operation log under one lock, plus the membership
//!   view mirrored from the authority. Slot 0 of the view is the primary.
//! - **Active Replication**: The primary proposes one pending request at a time; it is committed
//!   only if every member votes for it. Joiners catch up from a peer's checkpoint, log and
//!   pending set while the cluster is quiescent.
//! - **Passive Replication**: The primary executes, backups buffer. Periodic checkpoints carry
//!   the store and the latest executed timestamps so backups can prune their buffers. A promoted
//!   backup replays what is left before serving.

pub mod active;
pub mod core;
pub mod failover;
pub mod gate;
pub mod passive;


use async_trait::async_trait;
use std::sync::Arc;

use crate::membership::types::NodeId;
use crate::transport::protocol::{ClientOp, Request};
use self::core::ReplicaCore;

/// The replication protocol a replica node runs.
#[async_trait]
pub trait ReplicationStrategy: Send + Sync {
    fn core(&self) -> &ReplicaCore;

    /// Answers a client's Get/Increment/Decrement.
    async fn handle_client_op(&self, source: NodeId, op: ClientOp) -> String;

    /// Installs a membership list broadcast by the authority.
    async fn handle_membership_change(self: Arc<Self>, members: Vec<NodeId>);

    /// Answers a protocol request exchanged between replicas.
    async fn handle_protocol_message(&self, source: NodeId, request: Request) -> String;

    /// Spawns the background loops the protocol runs from the start.
    fn start(self: Arc<Self>) {}
}
