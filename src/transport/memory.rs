//! In-process network.
//!
//! Routes requests and datagrams between endpoints living in the same process.
//! Every request is encoded to wire text and decoded again on delivery, so the
//! codec is exercised exactly as with the socket transport. A node marked down
//! neither sends nor receives; a request whose destination goes down while
//! handling it loses its response.

use super::protocol::Request;
use super::{Endpoint, Transport};
use crate::membership::types::{Datagram, NodeId};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct MemoryNetwork {
    endpoints: DashMap<NodeId, Arc<dyn Endpoint>>,
    down: DashSet<NodeId>,
    drop_datagrams: AtomicBool,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the transport a node uses to talk through this network.
    pub fn transport(self: &Arc<Self>, local: impl Into<NodeId>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            local: local.into(),
            network: self.clone(),
        })
    }

    pub fn register(&self, id: NodeId, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(id, endpoint);
    }

    /// Takes a node off the network, as if its process had crashed.
    pub fn crash(&self, id: &NodeId) {
        tracing::info!("Network: {} is down", id);
        self.down.insert(id.clone());
    }

    pub fn recover(&self, id: &NodeId) {
        tracing::info!("Network: {} is up", id);
        self.down.remove(id);
    }

    pub fn is_up(&self, id: &NodeId) -> bool {
        !self.down.contains(id)
    }

    /// Silently discards every datagram while set.
    pub fn set_drop_datagrams(&self, drop: bool) {
        self.drop_datagrams.store(drop, Ordering::SeqCst);
    }

    fn endpoint(&self, id: &NodeId) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.get(id).map(|entry| entry.value().clone())
    }
}

pub struct MemoryTransport {
    local: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn send_request(&self, destination: &NodeId, request: &Request) -> Option<String> {
        if !self.network.is_up(&self.local) || !self.network.is_up(destination) {
            tracing::debug!("{} -> {}: unreachable", self.local, destination);
            return None;
        }
        let endpoint = self.network.endpoint(destination)?;

        let decoded = match request.to_string().parse::<Request>() {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::error!("Failed to decode request {}: {}", request, e);
                return None;
            }
        };

        let source = self.local.clone();
        let handler = tokio::spawn(async move { endpoint.handle_request(source, decoded).await });
        let response = handler.await.ok()?;

        if !self.network.is_up(destination) || !self.network.is_up(&self.local) {
            return None;
        }
        Some(response)
    }

    async fn send_message(&self, destination: &NodeId, datagram: &Datagram) {
        if self.network.drop_datagrams.load(Ordering::SeqCst)
            || !self.network.is_up(&self.local)
            || !self.network.is_up(destination)
        {
            return;
        }

        if let Some(endpoint) = self.network.endpoint(destination) {
            let datagram = datagram.clone();
            tokio::spawn(async move { endpoint.handle_message(datagram).await });
        }
    }
}
