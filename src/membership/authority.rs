use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use super::detector::LivenessSink;
use super::types::{LivenessEvent, NodeId};
use crate::transport::Transport;
use crate::transport::protocol::Request;

/// Source of truth for which replicas are alive, in the order they joined.
///
/// Slot 0 of the list is the primary. Every change is broadcast as the full
/// list to the members of the new list.
pub struct MembershipAuthority {
    transport: Arc<dyn Transport>,
    replicas: HashSet<NodeId>,
    membership: RwLock<Vec<NodeId>>,
    /// Serializes broadcasts so that replicas receive lists in order.
    broadcast_lock: tokio::sync::Mutex<()>,
}

impl MembershipAuthority {
    pub fn new(transport: Arc<dyn Transport>, replicas: impl IntoIterator<Item = NodeId>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            replicas: replicas.into_iter().collect(),
            membership: RwLock::new(Vec::new()),
            broadcast_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.membership
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies one transition; returns `true` if the list changed.
    pub fn apply(&self, event: &LivenessEvent) -> bool {
        if !self.replicas.contains(event.node()) {
            return false;
        }

        let mut membership = self.membership.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            LivenessEvent::Alive(node) => {
                if membership.contains(node) {
                    return false;
                }
                membership.push(node.clone());
                true
            }
            LivenessEvent::Dead(node) => {
                let before = membership.len();
                membership.retain(|member| member != node);
                membership.len() != before
            }
        }
    }

    /// Sends the current list to every member of it.
    pub async fn broadcast(&self) {
        let _ordered = self.broadcast_lock.lock().await;
        let members = self.members();

        tracing::info!("Broadcasting membership {:?}", members);
        let responses = self
            .transport
            .send_request_to_group(&members, &Request::Membership(members.clone()))
            .await;

        for (member, response) in responses {
            if response.is_none() {
                tracing::warn!("Membership broadcast to {} failed", member);
            }
        }
    }

    /// Pushes a new checkpoint interval to every configured replica.
    pub async fn set_checkpoint_interval(&self, interval_ms: i64) {
        let replicas: Vec<NodeId> = self.replicas.iter().cloned().collect();
        tracing::info!("Setting checkpoint interval to {}ms on {:?}", interval_ms, replicas);

        self.transport
            .send_request_to_group(&replicas, &Request::CheckpointInterval(interval_ms))
            .await;
    }
}

#[async_trait]
impl LivenessSink for MembershipAuthority {
    async fn report(&self, event: LivenessEvent) {
        if self.apply(&event) {
            tracing::info!("Membership changed on {:?}: {:?}", event, self.members());
            self.broadcast().await;
        } else {
            tracing::debug!("Membership unchanged on {:?}", event);
        }
    }
}
