use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::ReplicationStrategy;
use super::core::{ReplicaCore, lock};
use crate::membership::types::NodeId;
use crate::storage::memory::{KeyValueStore, StoreState};
use crate::transport::Transport;
use crate::transport::protocol::{
    ACK, CheckpointPayload, ClientOp, NOT_PRIMARY, Operation, Request, UserRequest, render_value,
};

/// Primary-backup replication: the primary executes, backups buffer until a
/// checkpoint proves the buffered requests were applied upstream.
pub struct PassiveReplica {
    core: ReplicaCore,
    /// Unexecuted mutations per client, oldest first.
    buffers: DashMap<NodeId, VecDeque<UserRequest>>,
    /// Highest timestamp per client a received checkpoint has covered.
    pruned: DashMap<NodeId, u64>,
    /// Latest executed timestamp per client since the last broadcast checkpoint.
    client_timestamps: Mutex<BTreeMap<NodeId, u64>>,
    /// Set once buffer replay started; later checkpoints are refused.
    promoting: AtomicBool,
}

impl PassiveReplica {
    pub fn new(transport: Arc<dyn Transport>, store: KeyValueStore, checkpoint_interval_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            core: ReplicaCore::new(transport, store, checkpoint_interval_ms),
            buffers: DashMap::new(),
            pruned: DashMap::new(),
            client_timestamps: Mutex::new(BTreeMap::new()),
            promoting: AtomicBool::new(false),
        })
    }

    /// Buffered requests of one client, oldest first.
    pub fn buffered(&self, client: &NodeId) -> Vec<UserRequest> {
        self.buffers
            .get(client)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffers.iter().map(|buffer| buffer.len()).sum()
    }

    fn execute(&self, request: &UserRequest) -> String {
        self.execute_in(&mut self.core.state(), request)
    }

    fn execute_in(&self, state: &mut StoreState, request: &UserRequest) -> String {
        let value = state.execute(request);
        if request.operation.is_mutating() {
            let mut timestamps = lock(&self.client_timestamps);
            let latest = timestamps.entry(request.source.clone()).or_insert(0);
            *latest = (*latest).max(request.timestamp);
        }
        render_value(value)
    }

    fn buffer(&self, request: UserRequest) {
        let covered = self.pruned.get(&request.source).map(|ts| *ts);
        if covered.is_some_and(|ts| request.timestamp <= ts) {
            tracing::debug!("{} drops {}, already covered by a checkpoint", self.core.id, request);
            return;
        }

        self.buffers
            .entry(request.source.clone())
            .or_default()
            .push_back(request);
    }

    /// Installs the primary's store and prunes the buffers it supersedes.
    pub fn apply_checkpoint(&self, payload: CheckpointPayload) {
        let mut state = self.core.state();
        if self.core.is_primary() || self.promoting.load(Ordering::SeqCst) {
            tracing::debug!("{} is taking over, ignoring checkpoint", self.core.id);
            return;
        }

        state.install(payload.store);

        for (client, timestamp) in payload.timestamps {
            if let Some(mut buffer) = self.buffers.get_mut(&client) {
                buffer.retain(|request| request.timestamp > timestamp);
            }
            let mut covered = self.pruned.entry(client).or_insert(0);
            *covered = (*covered).max(timestamp);
        }
        drop(state);

        tracing::debug!(
            "{} applied checkpoint, {} requests still buffered",
            self.core.id,
            self.buffered_len()
        );
    }

    /// Replays every buffered request in timestamp order and returns how many.
    ///
    /// Runs under the store lock, so a checkpoint being applied finishes first
    /// and any checkpoint arriving afterwards is refused.
    pub fn replay_buffers(&self) -> usize {
        let mut state = self.core.state();
        self.promoting.store(true, Ordering::SeqCst);

        let mut replay: Vec<UserRequest> = Vec::new();
        let clients: Vec<NodeId> = self.buffers.iter().map(|entry| entry.key().clone()).collect();
        for client in clients {
            if let Some((_, buffer)) = self.buffers.remove(&client) {
                replay.extend(buffer);
            }
        }
        replay.sort_by_key(|request| request.timestamp);

        tracing::info!("{} replays {} buffered requests", self.core.id, replay.len());
        for request in &replay {
            self.execute_in(&mut state, request);
        }
        replay.len()
    }

    /// Replays the buffers and starts acting as primary.
    async fn promote(self: Arc<Self>) {
        self.replay_buffers();
        self.core.primary.open();
        tracing::info!("{} is now primary", self.core.id);

        tokio::spawn(async move {
            self.checkpoint_loop().await;
        });
    }

    /// Captures the store and the executed timestamps, resetting the latter.
    pub fn take_checkpoint(&self) -> CheckpointPayload {
        let mut state = self.core.state();
        let timestamps = std::mem::take(&mut *lock(&self.client_timestamps));
        state.rotate();

        CheckpointPayload {
            store: state.store.clone(),
            timestamps,
        }
    }

    async fn checkpoint_loop(self: Arc<Self>) {
        loop {
            let payload = self.take_checkpoint();
            let members = self.core.membership().await;

            let responses = self
                .core
                .transport
                .send_request_to_others(&members, &Request::Checkpoint(payload))
                .await;
            for (backup, response) in responses {
                if response.is_none() {
                    tracing::warn!("Checkpoint to {} failed", backup);
                }
            }

            tokio::time::sleep(self.core.checkpoint_interval()).await;
        }
    }
}

#[async_trait]
impl ReplicationStrategy for PassiveReplica {
    fn core(&self) -> &ReplicaCore {
        &self.core
    }

    async fn handle_client_op(&self, source: NodeId, op: ClientOp) -> String {
        let request = op.from_client(source);

        if self.core.is_primary() {
            return self.execute(&request);
        }

        match request.operation {
            Operation::Get => ACK.to_string(),
            Operation::Increment | Operation::Decrement => {
                self.buffer(request);
                ACK.to_string()
            }
        }
    }

    async fn handle_membership_change(self: Arc<Self>, members: Vec<NodeId>) {
        let mut view = self.core.membership_write().await;
        tracing::info!("{} installs membership {:?}", self.core.id, members);
        *view = members.clone();

        if self.core.leads(&members) && !self.core.is_primary() {
            self.clone().promote().await;
        }
    }

    async fn handle_protocol_message(&self, source: NodeId, request: Request) -> String {
        match request {
            Request::Checkpoint(payload) => {
                self.apply_checkpoint(payload);
                ACK.to_string()
            }
            Request::Upgraded => {
                // The view lock is held through a promotion in progress.
                let members = self.core.membership().await;
                if self.core.leads(&members) && self.core.is_primary() {
                    ACK.to_string()
                } else {
                    tracing::debug!("{} is not the primary of {:?}", self.core.id, members);
                    NOT_PRIMARY.to_string()
                }
            }
            other => {
                tracing::warn!("{} got unexpected {} from {}", self.core.id, other, source);
                format!("Error: Unexpected request {}!", other)
            }
        }
    }
}
