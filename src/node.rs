//! Node Composition
//!
//! Every process runs a failure detector; what else it does depends on its role.
//!
//! ## Roles
//! - **Relay**: Only detects and relays liveness transitions.
//! - **Authority**: Root of the detection tree, owns the membership list.
//! - **Replica**: Holds the store and runs the configured replication protocol.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ClusterConfig, NodeRole, ReplicationMode};
use crate::membership::authority::MembershipAuthority;
use crate::membership::detector::{FailureDetector, LivenessSink};
use crate::membership::types::{Datagram, LivenessEvent, NodeId};
use crate::replication::ReplicationStrategy;
use crate::replication::active::ActiveReplica;
use crate::replication::passive::PassiveReplica;
use crate::storage::memory::KeyValueStore;
use crate::transport::protocol::{ACK, NOT_AUTHORITY, NOT_REPLICA, Request, join_members};
use crate::transport::{Endpoint, Transport};

pub enum Role {
    Relay,
    Authority(Arc<MembershipAuthority>),
    Replica(Arc<dyn ReplicationStrategy>),
}

pub struct Node {
    pub id: NodeId,
    detector: Arc<FailureDetector>,
    role: Role,
}

impl Node {
    pub fn new(id: NodeId, detector: Arc<FailureDetector>, role: Role) -> Arc<Self> {
        Arc::new(Self { id, detector, role })
    }

    /// Builds the node `transport` speaks for, with the role the config gives it.
    pub fn from_config(config: &ClusterConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let id = transport.local_id().clone();
        let links = config.links(&id);

        let role = match config.role_of(&id) {
            NodeRole::Authority => Role::Authority(MembershipAuthority::new(
                transport.clone(),
                config.replicas.iter().cloned(),
            )),
            NodeRole::Replica => {
                let store = KeyValueStore::from_entries(config.initial_data.clone());
                match config.replication {
                    ReplicationMode::Active => Role::Replica(ActiveReplica::new(
                        transport.clone(),
                        store,
                        config.checkpoint_interval_ms,
                    )),
                    ReplicationMode::Passive => Role::Replica(PassiveReplica::new(
                        transport.clone(),
                        store,
                        config.checkpoint_interval_ms,
                    )),
                }
            }
            NodeRole::Relay => Role::Relay,
        };

        let root_sink: Option<Arc<dyn LivenessSink>> = match &role {
            Role::Authority(authority) => Some(authority.clone()),
            _ => None,
        };

        let detector = FailureDetector::new(
            transport,
            links.parents,
            links.children,
            config.heartbeat_interval_ms,
            config.heartbeat_tolerance,
            root_sink,
        );

        tracing::info!("Node {} configured as {:?}", id, config.role_of(&id));
        Self::new(id, detector, role)
    }

    pub fn start(&self) {
        self.detector.start();
        if let Role::Replica(replica) = &self.role {
            replica.clone().start();
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    /// Acknowledges a child's report and passes it on in the background.
    fn relay(&self, event: LivenessEvent) -> String {
        let detector = self.detector.clone();
        tokio::spawn(async move {
            detector.propagate(event).await;
        });
        ACK.to_string()
    }
}

#[async_trait]
impl Endpoint for Node {
    async fn handle_request(&self, source: NodeId, request: Request) -> String {
        match request {
            Request::Alive(node) => self.relay(LivenessEvent::Alive(node)),
            Request::Dead(node) => self.relay(LivenessEvent::Dead(node)),
            Request::HeartbeatInterval(interval_ms) => {
                self.detector.set_heartbeat_interval(interval_ms).await;
                ACK.to_string()
            }
            Request::HeartbeatTolerance(tolerance) => {
                self.detector.set_heartbeat_tolerance(tolerance).await;
                ACK.to_string()
            }
            Request::MembershipQuery => match &self.role {
                Role::Authority(authority) => join_members(&authority.members()),
                _ => NOT_AUTHORITY.to_string(),
            },
            Request::CheckpointInterval(interval_ms) => match &self.role {
                Role::Authority(authority) => {
                    authority.set_checkpoint_interval(interval_ms).await;
                    ACK.to_string()
                }
                Role::Replica(replica) => {
                    replica.core().set_checkpoint_interval(interval_ms);
                    ACK.to_string()
                }
                Role::Relay => NOT_REPLICA.to_string(),
            },
            Request::Membership(members) => match &self.role {
                Role::Replica(replica) => {
                    replica.clone().handle_membership_change(members).await;
                    ACK.to_string()
                }
                _ => NOT_REPLICA.to_string(),
            },
            Request::Client(op) => match &self.role {
                Role::Replica(replica) => replica.handle_client_op(source, op).await,
                _ => NOT_REPLICA.to_string(),
            },
            other => match &self.role {
                Role::Replica(replica) => replica.handle_protocol_message(source, other).await,
                _ => {
                    tracing::warn!("{} cannot handle {} from {}", self.id, other, source);
                    NOT_REPLICA.to_string()
                }
            },
        }
    }

    async fn handle_message(&self, datagram: Datagram) {
        self.detector.handle_heartbeat(datagram).await;
    }
}
