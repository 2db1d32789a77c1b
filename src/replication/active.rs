use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot};

use super::ReplicationStrategy;
use super::core::{ReplicaCore, lock};
use super::failover::{self, Decision};
use super::gate::Gate;
use crate::error::halt;
use crate::membership::types::NodeId;
use crate::storage::memory::KeyValueStore;
use crate::transport::Transport;
use crate::transport::protocol::{
    ABORTED, ACK, ClientOp, NO, NO_REQUEST, Request, RestoreSnapshot, UserRequest, YES,
    render_value,
};

/// Outcomes of decided requests are kept for re-deliveries up to this many.
const DECIDED_CACHE_LIMIT: usize = 10_000;

type Waiters = Vec<oneshot::Sender<String>>;

#[derive(Default)]
struct PendingRequests {
    /// Client requests awaiting a decision, oldest first, with the clients
    /// waiting for their outcome.
    queue: Vec<(UserRequest, Waiters)>,
    /// Requests learned through state transfer that no local client waits on.
    restored: Vec<UserRequest>,
    decided: HashMap<UserRequest, String>,
}

impl PendingRequests {
    fn is_queued(&self, request: &UserRequest) -> bool {
        self.queue.iter().any(|(queued, _)| queued == request)
    }

    fn contains(&self, request: &UserRequest) -> bool {
        self.is_queued(request) || self.restored.contains(request)
    }

    fn next_candidate(&self) -> Option<UserRequest> {
        self.queue
            .first()
            .map(|(request, _)| request)
            .or_else(|| self.restored.first())
            .cloned()
    }

    /// Every undecided request, queued ones first.
    fn requests(&self) -> Vec<UserRequest> {
        self.queue
            .iter()
            .map(|(request, _)| request)
            .chain(self.restored.iter())
            .cloned()
            .collect()
    }

    fn enqueue(&mut self, request: UserRequest, waiter: oneshot::Sender<String>) {
        match self.queue.iter_mut().find(|(queued, _)| *queued == request) {
            Some((_, waiters)) => waiters.push(waiter),
            None => self.queue.push((request, vec![waiter])),
        }
    }

    fn take_queued(&mut self, request: &UserRequest) -> Option<Waiters> {
        let index = self.queue.iter().position(|(queued, _)| queued == request)?;
        Some(self.queue.remove(index).1)
    }

    fn take_restored(&mut self, request: &UserRequest) -> bool {
        let before = self.restored.len();
        self.restored.retain(|restored| restored != request);
        self.restored.len() != before
    }

    fn remember(&mut self, request: UserRequest, outcome: String) {
        if self.decided.len() > DECIDED_CACHE_LIMIT {
            self.decided.clear();
        }
        self.decided.insert(request, outcome);
    }
}

/// Active replication: every member executes every request, in the order the
/// primary gets them unanimously accepted.
pub struct ActiveReplica {
    core: ReplicaCore,
    pending: Mutex<PendingRequests>,
    /// Wakes the vote loop when a request is queued.
    wake: Notify,
    /// Open once this replica caught up with its peers.
    restored: Gate,
    /// Closed while a joining peer copies this replica's state.
    unblocked: Gate,
    /// Peers that copied this replica's state and may not be in its view yet.
    joiners: Mutex<Vec<NodeId>>,
    current: Mutex<Option<UserRequest>>,
    previous: Mutex<Option<UserRequest>>,
}

impl ActiveReplica {
    pub fn new(transport: Arc<dyn Transport>, store: KeyValueStore, checkpoint_interval_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            core: ReplicaCore::new(transport, store, checkpoint_interval_ms),
            pending: Mutex::new(PendingRequests::default()),
            wake: Notify::new(),
            restored: Gate::new(false),
            unblocked: Gate::new(true),
            joiners: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            previous: Mutex::new(None),
        })
    }

    fn pending(&self) -> MutexGuard<'_, PendingRequests> {
        lock(&self.pending)
    }

    pub fn pending_len(&self) -> usize {
        let pending = self.pending();
        pending.queue.len() + pending.restored.len()
    }

    pub fn is_restored(&self) -> bool {
        self.restored.is_open()
    }

    pub fn is_blocked(&self) -> bool {
        !self.unblocked.is_open()
    }

    pub fn current(&self) -> Option<UserRequest> {
        lock(&self.current).clone()
    }

    pub fn previous(&self) -> Option<UserRequest> {
        lock(&self.previous).clone()
    }

    async fn answer_vote(&self, request: UserRequest) -> &'static str {
        self.restored.wait_open().await;
        self.unblocked.wait_open().await;

        if self.pending().contains(&request) {
            *lock(&self.current) = Some(request);
            YES
        } else {
            tracing::debug!("{} votes No on unknown {}", self.core.id, request);
            NO
        }
    }

    /// Executes a committed request, at most once per request.
    pub fn commit(&self, request: &UserRequest) {
        let replies = {
            let mut state = self.core.state();
            let mut pending = self.pending();

            if let Some(waiters) = pending.take_queued(request) {
                pending.take_restored(request);
                let outcome = render_value(state.execute(request));
                pending.remember(request.clone(), outcome.clone());
                Some((waiters, outcome))
            } else if pending.take_restored(request) {
                state.reapply(request);
                let outcome = render_value(state.store.get(&request.key));
                pending.remember(request.clone(), outcome);
                None
            } else {
                tracing::debug!("{} ignores Do for unknown {}", self.core.id, request);
                None
            }
        };

        *lock(&self.previous) = Some(request.clone());
        *lock(&self.current) = None;

        if let Some((waiters, outcome)) = replies {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Drops an aborted request and fails its waiting clients.
    pub fn give_up(&self, request: &UserRequest) {
        let waiters = {
            let mut pending = self.pending();
            pending.take_restored(request);
            pending.remember(request.clone(), ABORTED.to_string());
            pending.take_queued(request)
        };

        *lock(&self.current) = None;

        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(ABORTED.to_string());
        }
    }

    fn restore_snapshot(&self) -> String {
        let state = self.core.state();
        let pending = self.pending();

        let checkpoint = match state.checkpoint.restore() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::error!("{} holds an unreadable checkpoint: {}", self.core.id, e);
                return format!("Error: {}", e);
            }
        };

        RestoreSnapshot {
            checkpoint,
            log: state.log.clone(),
            pending: pending.requests(),
        }
        .encode()
    }

    /// Loads a peer's checkpoint, replays its log and adopts its pending set.
    fn install_snapshot(&self, snapshot: RestoreSnapshot) {
        let replies = {
            let mut state = self.core.state();
            let mut pending = self.pending();
            let mut replies = Vec::new();

            state.install(snapshot.checkpoint);

            for entry in &snapshot.log {
                match pending.take_queued(entry) {
                    Some(waiters) => {
                        let outcome = render_value(state.execute(entry));
                        pending.remember(entry.clone(), outcome.clone());
                        replies.push((waiters, outcome));
                    }
                    None => {
                        state.reapply(entry);
                        let outcome = render_value(state.store.get(&entry.key));
                        pending.remember(entry.clone(), outcome);
                    }
                }
            }

            for entry in snapshot.pending {
                if !pending.contains(&entry) {
                    pending.restored.push(entry);
                }
            }

            replies
        };

        for (waiters, outcome) in replies {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Copies state from the first responsive peer while all peers are quiescent.
    async fn restore_from_peers(&self, members: &[NodeId]) {
        let transport = &self.core.transport;
        let peers: Vec<NodeId> = members
            .iter()
            .filter(|member| **member != self.core.id)
            .cloned()
            .collect();

        if peers.is_empty() {
            tracing::info!("{} is the first member, nothing to restore", self.core.id);
            self.restored.open();
            return;
        }

        tracing::info!("{} restoring state from {:?}", self.core.id, peers);
        transport.send_request_to_group(&peers, &Request::Block).await;

        let mut installed = false;
        for peer in &peers {
            let Some(answer) = transport.send_request(peer, &Request::Restore).await else {
                continue;
            };
            match RestoreSnapshot::decode(&answer) {
                Ok(snapshot) => {
                    tracing::info!(
                        "{} restored from {}: {} log entries, {} pending",
                        self.core.id,
                        peer,
                        snapshot.log.len(),
                        snapshot.pending.len()
                    );
                    self.install_snapshot(snapshot);
                    installed = true;
                    break;
                }
                Err(e) => tracing::warn!("Unusable state from {}: {}", peer, e),
            }
        }

        if !installed {
            tracing::warn!("{} found no peer to restore from", self.core.id);
        }

        transport.send_request_to_group(&peers, &Request::Unblock).await;
        self.restored.open();
    }

    /// Settles the request a crashed primary may have left half committed.
    async fn reconcile(&self, members: &[NodeId]) {
        let transport = &self.core.transport;

        let answers = transport.send_request_to_others(members, &Request::Current).await;
        let mut slots: Vec<(NodeId, Option<UserRequest>)> = answers
            .into_iter()
            .filter_map(|(member, answer)| answer.map(|a| (member, failover::parse_slot(&a))))
            .collect();
        slots.push((self.core.id.clone(), self.current()));

        let in_flight = match failover::classify(slots) {
            Ok(in_flight) => in_flight,
            Err(violation) => halt(violation),
        };

        let decision = match failover::plan(&in_flight) {
            Decision::ComparePrevious => {
                let remote: Vec<NodeId> = in_flight
                    .free
                    .iter()
                    .filter(|member| **member != self.core.id)
                    .cloned()
                    .collect();
                let answers = transport.send_request_to_group(&remote, &Request::Previous).await;

                let mut previous: Vec<Option<UserRequest>> = answers
                    .into_values()
                    .flatten()
                    .map(|answer| failover::parse_slot(&answer))
                    .collect();
                if in_flight.free.contains(&self.core.id) {
                    previous.push(self.previous());
                }

                match failover::resolve_previous(&in_flight, previous) {
                    Ok(decision) => decision,
                    Err(violation) => halt(violation),
                }
            }
            decision => decision,
        };

        if let Decision::Reissue { request, targets } = decision {
            tracing::warn!("{} finishes in-doubt {} on {:?}", self.core.id, request, targets);

            if targets.contains(&self.core.id) {
                self.commit(&request);
            }
            let remote: Vec<NodeId> = targets
                .into_iter()
                .filter(|member| *member != self.core.id)
                .collect();
            transport.send_request_to_group(&remote, &Request::Do(request)).await;
        }
    }

    async fn vote_loop(self: Arc<Self>) {
        tracing::info!("{} starts proposing requests", self.core.id);

        loop {
            self.unblocked.wait_open().await;

            let candidate = self.pending().next_candidate();
            let Some(request) = candidate else {
                self.wake.notified().await;
                continue;
            };

            self.run_round(request).await;
        }
    }

    /// Proposes one request to the current members and decides it.
    async fn run_round(&self, request: UserRequest) {
        let transport = &self.core.transport;

        let votes = {
            let members = self.core.membership_read().await;
            lock(&self.joiners).retain(|joiner| !members.contains(joiner));

            *lock(&self.current) = Some(request.clone());
            transport
                .send_request_to_others(&members, &Request::Vote(request.clone()))
                .await
        };

        // A peer that joined while votes were collected holds the request as
        // restored and must learn the decision too.
        let members = self.decision_targets().await;

        let rejected: Vec<&NodeId> = votes
            .iter()
            .filter(|(_, vote)| vote.as_deref() != Some(YES))
            .map(|(member, _)| member)
            .collect();

        if rejected.is_empty() {
            tracing::info!("Committing {}", request);
            self.commit(&request);
            transport
                .send_request_to_others(&members, &Request::Do(request))
                .await;
        } else {
            tracing::warn!("Aborting {}, rejected by {:?}", request, rejected);
            self.give_up(&request);
            transport
                .send_request_to_others(&members, &Request::GiveUp(request))
                .await;
        }
    }

    /// The latest view plus every peer that restored from this replica since.
    async fn decision_targets(&self) -> Vec<NodeId> {
        let mut targets = self.core.membership().await;
        for joiner in lock(&self.joiners).iter() {
            if !targets.contains(joiner) {
                targets.push(joiner.clone());
            }
        }
        targets
    }

    fn note_joiner(&self, peer: NodeId) {
        let mut joiners = lock(&self.joiners);
        if !joiners.contains(&peer) {
            joiners.push(peer);
        }
    }

    async fn rotation_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.core.checkpoint_interval()).await;
            self.core.rotate_checkpoint();
        }
    }
}

#[async_trait]
impl ReplicationStrategy for ActiveReplica {
    fn core(&self) -> &ReplicaCore {
        &self.core
    }

    async fn handle_client_op(&self, source: NodeId, op: ClientOp) -> String {
        let request = op.from_client(source);

        let outcome = {
            let mut pending = self.pending();
            match pending.decided.get(&request) {
                Some(outcome) => Err(outcome.clone()),
                None => {
                    let (sender, receiver) = oneshot::channel();
                    pending.enqueue(request.clone(), sender);
                    Ok(receiver)
                }
            }
        };

        match outcome {
            Err(decided) => {
                tracing::debug!("{} already decided {}", self.core.id, request);
                decided
            }
            Ok(receiver) => {
                self.wake.notify_one();
                receiver.await.unwrap_or_else(|_| ABORTED.to_string())
            }
        }
    }

    async fn handle_membership_change(self: Arc<Self>, members: Vec<NodeId>) {
        let mut view = self.core.membership_write().await;
        tracing::info!("{} installs membership {:?}", self.core.id, members);
        *view = members.clone();

        if !self.restored.is_open() && members.contains(&self.core.id) {
            self.restore_from_peers(&members).await;
        }

        if self.core.leads(&members) && !self.core.is_primary() {
            tracing::info!("{} becomes primary", self.core.id);
            self.reconcile(&members).await;
            self.core.primary.open();

            let replica = self.clone();
            tokio::spawn(async move {
                replica.vote_loop().await;
            });
        }
    }

    async fn handle_protocol_message(&self, source: NodeId, request: Request) -> String {
        match request {
            Request::Vote(request) => self.answer_vote(request).await.to_string(),
            Request::Do(request) => {
                self.commit(&request);
                ACK.to_string()
            }
            Request::GiveUp(request) => {
                self.give_up(&request);
                ACK.to_string()
            }
            Request::Block => {
                tracing::info!("{} blocked by {}", self.core.id, source);
                self.unblocked.close();
                ACK.to_string()
            }
            Request::Unblock => {
                tracing::info!("{} unblocked by {}", self.core.id, source);
                self.unblocked.open();
                ACK.to_string()
            }
            Request::Restore => {
                self.note_joiner(source);
                self.restore_snapshot()
            }
            Request::Current => self
                .current()
                .map_or_else(|| NO_REQUEST.to_string(), |request| request.to_string()),
            Request::Previous => self
                .previous()
                .map_or_else(|| NO_REQUEST.to_string(), |request| request.to_string()),
            other => {
                tracing::warn!("{} got unexpected {} from {}", self.core.id, other, source);
                format!("Error: Unexpected request {}!", other)
            }
        }
    }

    fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.rotation_loop().await;
        });
    }
}
