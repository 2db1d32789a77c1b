//! Transport Module
//!
//! Point-to-point messaging between nodes, consumed by every other subsystem.
//!
//! ## Channels
//! - **Requests**: reliable request/response, one logical connection per peer,
//!   rebuilt once on failure before the peer is reported unreachable (`None`).
//! - **Datagrams**: unreliable, unordered, fire-and-forget. Used for heartbeats.
//!
//! ## Implementations
//! - `net::NetTransport`: HTTP (`axum` server, `reqwest` client) plus UDP.
//! - `memory::MemoryNetwork`: in-process routing with switchable node outages.

pub mod handlers;
pub mod memory;
pub mod net;
pub mod protocol;


use crate::membership::types::{Datagram, NodeId};
use protocol::Request;

use async_trait::async_trait;
use std::collections::HashMap;

/// Responses of a fan-out, `None` for every destination that was unreachable.
pub type GroupResponses = HashMap<NodeId, Option<String>>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Sends a request and waits for its response; `None` if unreachable.
    async fn send_request(&self, destination: &NodeId, request: &Request) -> Option<String>;

    /// Sends a best-effort datagram.
    async fn send_message(&self, destination: &NodeId, datagram: &Datagram);

    /// Sends the same request to every destination concurrently and joins all.
    async fn send_request_to_group(&self, group: &[NodeId], request: &Request) -> GroupResponses {
        let sends = group.iter().map(|destination| async move {
            let response = self.send_request(destination, request).await;
            (destination.clone(), response)
        });

        futures::future::join_all(sends).await.into_iter().collect()
    }

    /// Like `send_request_to_group`, skipping this node.
    async fn send_request_to_others(&self, group: &[NodeId], request: &Request) -> GroupResponses {
        let others: Vec<NodeId> = group
            .iter()
            .filter(|member| *member != self.local_id())
            .cloned()
            .collect();

        self.send_request_to_group(&others, request).await
    }
}

/// The serving side of a node: receives decoded requests and datagrams.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Handles one request and returns the response text for the caller.
    async fn handle_request(&self, source: NodeId, request: Request) -> String;

    async fn handle_message(&self, datagram: Datagram);
}
