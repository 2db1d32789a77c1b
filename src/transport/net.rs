//! Socket transport.
//!
//! Requests travel as JSON envelopes over HTTP (`POST /rpc`), reusing the
//! pooled `reqwest` connection to each peer. Heartbeats are bincode datagrams
//! on a UDP socket bound to the same port number as the HTTP listener.

use super::handlers::handle_rpc;
use super::protocol::{ENDPOINT_RPC, Request, RpcEnvelope, RpcReply};
use super::{Endpoint, Transport};
use crate::membership::types::{Datagram, NodeId};

use anyhow::Result;
use async_trait::async_trait;
use axum::{Extension, Router, routing::post};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// First attempt plus one rebuild of the connection.
const SEND_ATTEMPTS: usize = 2;

pub struct NetTransport {
    local: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    http_client: reqwest::Client,
    socket: Option<Arc<UdpSocket>>,
}

impl NetTransport {
    /// Transport for a serving node: binds the datagram socket on the node's
    /// configured address.
    pub async fn bind(local: NodeId, peers: HashMap<NodeId, SocketAddr>) -> Result<Arc<Self>> {
        let addr = *peers
            .get(&local)
            .ok_or_else(|| anyhow::anyhow!("No address configured for {}", local))?;
        let socket = UdpSocket::bind(addr).await?;

        Ok(Arc::new(Self {
            local,
            peers,
            http_client: build_client()?,
            socket: Some(Arc::new(socket)),
        }))
    }

    /// Transport for a client process, which only issues requests.
    pub fn client(local: NodeId, peers: HashMap<NodeId, SocketAddr>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            local,
            peers,
            http_client: build_client()?,
            socket: None,
        }))
    }

    /// Serves requests and datagrams for `endpoint` until the listener fails.
    pub async fn serve(self: Arc<Self>, endpoint: Arc<dyn Endpoint>) -> Result<()> {
        let addr = *self
            .peers
            .get(&self.local)
            .ok_or_else(|| anyhow::anyhow!("No address configured for {}", self.local))?;

        if let Some(socket) = self.socket.clone() {
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                receive_loop(socket, endpoint).await;
            });
        }

        let app = Router::new()
            .route(ENDPOINT_RPC, post(handle_rpc))
            .layer(Extension(endpoint));

        tracing::info!("{} listening on {}", self.local, addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    async fn post_with_retry(&self, url: String, payload: &RpcEnvelope) -> Result<reqwest::Response> {
        let mut delay_ms = 50u64;

        for attempt in 0..SEND_ATTEMPTS {
            let response = self.http_client.post(url.clone()).json(payload).send().await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == SEND_ATTEMPTS {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 20;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms *= 2;
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

fn build_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?)
}

#[async_trait]
impl Transport for NetTransport {
    fn local_id(&self) -> &NodeId {
        &self.local
    }

    async fn send_request(&self, destination: &NodeId, request: &Request) -> Option<String> {
        let Some(addr) = self.peers.get(destination) else {
            tracing::error!("No such destination: {}", destination);
            return None;
        };

        let payload = RpcEnvelope {
            source: self.local.clone(),
            payload: request.to_string(),
        };
        tracing::debug!("{} sends request to {}: {}", self.local, destination, payload.payload);

        let response = match self
            .post_with_retry(format!("http://{}{}", addr, ENDPOINT_RPC), &payload)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", destination, e);
                return None;
            }
        };

        match response.json::<RpcReply>().await {
            Ok(reply) => {
                tracing::debug!("{} receives response from {}: {}", self.local, destination, reply.body);
                Some(reply.body)
            }
            Err(e) => {
                tracing::warn!("Malformed reply from {}: {}", destination, e);
                None
            }
        }
    }

    async fn send_message(&self, destination: &NodeId, datagram: &Datagram) {
        let Some(socket) = &self.socket else {
            tracing::warn!("{} has no datagram socket", self.local);
            return;
        };
        let Some(addr) = self.peers.get(destination) else {
            tracing::error!("No such destination: {}", destination);
            return;
        };

        match bincode::serialize(datagram) {
            Ok(encoded) => {
                if let Err(e) = socket.send_to(&encoded, addr).await {
                    tracing::warn!("Failed to send datagram to {}: {}", destination, e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize datagram: {}", e),
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, endpoint: Arc<dyn Endpoint>) {
    let mut buf = vec![0u8; 65536];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => match bincode::deserialize::<Datagram>(&buf[..len]) {
                Ok(datagram) => endpoint.handle_message(datagram).await,
                Err(e) => {
                    tracing::warn!("Failed to deserialize datagram from {}: {}", src, e);
                }
            },
            Err(e) => {
                tracing::error!("Failed to receive UDP packet: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
