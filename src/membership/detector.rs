use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use super::types::{Datagram, LivenessEvent, NodeId};
use crate::transport::Transport;
use crate::transport::protocol::{ACK, Request};

/// Consumer of liveness transitions at the root of the detection tree.
#[async_trait]
pub trait LivenessSink: Send + Sync {
    async fn report(&self, event: LivenessEvent);
}

/// Heartbeat-based failure detector on one node of the static detection tree.
///
/// Children push heartbeats as datagrams; every tick decays each child's
/// tolerance counter. A counter reaching zero reports `Dead(child)` once, a
/// heartbeat lifting a non-positive counter reports `Alive(child)` once.
pub struct FailureDetector {
    local: NodeId,
    transport: Arc<dyn Transport>,
    parents: Vec<NodeId>,
    children: Vec<NodeId>,
    tolerances: DashMap<NodeId, i64>,
    heartbeat_interval_ms: AtomicI64,
    heartbeat_tolerance: AtomicI64,
    /// Receives transitions when this node has no parents to relay to.
    root_sink: Option<Arc<dyn LivenessSink>>,
}

impl FailureDetector {
    pub fn new(
        transport: Arc<dyn Transport>,
        parents: Vec<NodeId>,
        children: Vec<NodeId>,
        heartbeat_interval_ms: i64,
        heartbeat_tolerance: i64,
        root_sink: Option<Arc<dyn LivenessSink>>,
    ) -> Arc<Self> {
        let tolerances = DashMap::new();
        for child in &children {
            tolerances.insert(child.clone(), 0);
        }

        Arc::new(Self {
            local: transport.local_id().clone(),
            transport,
            parents,
            children,
            tolerances,
            heartbeat_interval_ms: AtomicI64::new(heartbeat_interval_ms),
            heartbeat_tolerance: AtomicI64::new(heartbeat_tolerance),
            root_sink,
        })
    }

    pub fn start(self: &Arc<Self>) {
        tracing::info!(
            "Starting failure detector on {} (parents: {:?}, children: {:?})",
            self.local,
            self.parents,
            self.children
        );

        if !self.parents.is_empty() {
            let detector = self.clone();
            tokio::spawn(async move {
                detector.heartbeat_loop().await;
            });
        }

        if !self.children.is_empty() {
            let detector = self.clone();
            tokio::spawn(async move {
                detector.decay_loop().await;
            });
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.load(Ordering::SeqCst) as u64)
    }

    pub fn heartbeat_tolerance(&self) -> i64 {
        self.heartbeat_tolerance.load(Ordering::SeqCst)
    }

    /// Current counter of a child, `None` for nodes that are not children.
    pub fn tolerance_of(&self, child: &NodeId) -> Option<i64> {
        self.tolerances.get(child).map(|entry| *entry.value())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let heartbeat = Datagram::Heartbeat {
            from: self.local.clone(),
        };

        loop {
            for parent in &self.parents {
                self.transport.send_message(parent, &heartbeat).await;
            }
            tokio::time::sleep(self.heartbeat_interval()).await;
        }
    }

    async fn decay_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.heartbeat_interval()).await;

            for child in self.decay_tolerances() {
                let detector = self.clone();
                tokio::spawn(async move {
                    detector.propagate(LivenessEvent::Dead(child)).await;
                });
            }
        }
    }

    /// Resets the sender's counter. Returns `true` when the child was
    /// considered dead before, i.e. this heartbeat revives it.
    pub fn record_heartbeat(&self, child: &NodeId) -> bool {
        let tolerance = self.heartbeat_tolerance();
        match self.tolerances.get_mut(child) {
            Some(mut counter) => {
                let previous = *counter;
                *counter = tolerance;
                previous <= 0
            }
            None => {
                tracing::debug!("Ignoring heartbeat from {}, not a child of {}", child, self.local);
                false
            }
        }
    }

    /// Decrements every positive counter once and returns the children whose
    /// counter just reached zero.
    pub fn decay_tolerances(&self) -> Vec<NodeId> {
        let mut expired = Vec::new();

        for mut entry in self.tolerances.iter_mut() {
            if *entry.value() > 0 {
                *entry.value_mut() -= 1;
                if *entry.value() == 0 {
                    expired.push(entry.key().clone());
                }
            }
        }

        expired
    }

    pub async fn handle_heartbeat(self: &Arc<Self>, datagram: Datagram) {
        let child = datagram.sender().clone();

        if self.record_heartbeat(&child) {
            let detector = self.clone();
            tokio::spawn(async move {
                detector.propagate(LivenessEvent::Alive(child)).await;
            });
        }
    }

    /// Forwards a transition toward the root: to every parent, or to the root
    /// sink on a node without parents.
    pub async fn propagate(&self, event: LivenessEvent) {
        match &event {
            LivenessEvent::Alive(node) => tracing::info!("{} reports {} alive", self.local, node),
            LivenessEvent::Dead(node) => tracing::warn!("{} reports {} dead", self.local, node),
        }

        if self.parents.is_empty() {
            match &self.root_sink {
                Some(sink) => sink.report(event).await,
                None => tracing::debug!("{} has no parent for {:?}", self.local, event),
            }
            return;
        }

        let request = match event {
            LivenessEvent::Alive(node) => Request::Alive(node),
            LivenessEvent::Dead(node) => Request::Dead(node),
        };

        let responses = self
            .transport
            .send_request_to_group(&self.parents, &request)
            .await;
        for (parent, response) in responses {
            if response.as_deref() != Some(ACK) {
                tracing::warn!("Parent {} did not acknowledge {}", parent, request);
            }
        }
    }

    /// Applies a new heartbeat interval here and in the whole subtree.
    pub async fn set_heartbeat_interval(&self, interval_ms: i64) {
        if interval_ms <= 0 {
            tracing::warn!("Ignoring non-positive heartbeat interval {}", interval_ms);
            return;
        }

        let request = Request::HeartbeatInterval(interval_ms);
        let current = self.heartbeat_interval_ms.load(Ordering::SeqCst);

        // A parent never decays faster than its children emit.
        if interval_ms < current {
            self.transport
                .send_request_to_group(&self.children, &request)
                .await;
            self.heartbeat_interval_ms.store(interval_ms, Ordering::SeqCst);
        } else {
            self.heartbeat_interval_ms.store(interval_ms, Ordering::SeqCst);
            self.transport
                .send_request_to_group(&self.children, &request)
                .await;
        }

        tracing::info!("{} heartbeat interval set to {}ms", self.local, interval_ms);
    }

    pub async fn set_heartbeat_tolerance(&self, tolerance: i64) {
        if tolerance <= 0 {
            tracing::warn!("Ignoring non-positive heartbeat tolerance {}", tolerance);
            return;
        }

        self.heartbeat_tolerance.store(tolerance, Ordering::SeqCst);
        self.transport
            .send_request_to_group(&self.children, &Request::HeartbeatTolerance(tolerance))
            .await;

        tracing::info!("{} heartbeat tolerance set to {}", self.local, tolerance);
    }
}

