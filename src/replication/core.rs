use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::gate::Gate;
use crate::membership::types::NodeId;
use crate::storage::memory::{KeyValueStore, StoreState};
use crate::transport::Transport;

/// State every replica carries regardless of the replication protocol.
pub struct ReplicaCore {
    pub id: NodeId,
    pub transport: Arc<dyn Transport>,
    membership: RwLock<Vec<NodeId>>,
    state: Mutex<StoreState>,
    checkpoint_interval_ms: AtomicI64,
    /// Open once this replica acts as primary.
    pub primary: Gate,
}

impl ReplicaCore {
    pub fn new(transport: Arc<dyn Transport>, store: KeyValueStore, checkpoint_interval_ms: i64) -> Self {
        Self {
            id: transport.local_id().clone(),
            transport,
            membership: RwLock::new(Vec::new()),
            state: Mutex::new(StoreState::new(store)),
            checkpoint_interval_ms: AtomicI64::new(checkpoint_interval_ms),
            primary: Gate::new(false),
        }
    }

    pub async fn membership(&self) -> Vec<NodeId> {
        self.membership.read().await.clone()
    }

    /// Holds the view stable for the duration of a protocol round.
    pub async fn membership_read(&self) -> RwLockReadGuard<'_, Vec<NodeId>> {
        self.membership.read().await
    }

    pub async fn membership_write(&self) -> RwLockWriteGuard<'_, Vec<NodeId>> {
        self.membership.write().await
    }

    /// Exclusive access to store, checkpoint and log together.
    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        lock(&self.state)
    }

    pub fn snapshot(&self) -> KeyValueStore {
        self.state().store.clone()
    }

    pub fn is_primary(&self) -> bool {
        self.primary.is_open()
    }

    /// `true` if `members` names this replica in slot 0.
    pub fn leads(&self, members: &[NodeId]) -> bool {
        members.first() == Some(&self.id)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms.load(Ordering::SeqCst) as u64)
    }

    pub fn set_checkpoint_interval(&self, interval_ms: i64) {
        if interval_ms <= 0 {
            tracing::warn!("Ignoring non-positive checkpoint interval {}", interval_ms);
            return;
        }
        self.checkpoint_interval_ms.store(interval_ms, Ordering::SeqCst);
        tracing::info!("{} checkpoint interval set to {}ms", self.id, interval_ms);
    }

    pub fn rotate_checkpoint(&self) {
        let mut state = self.state();
        state.rotate();
        tracing::debug!("{} rotated checkpoint: {}", self.id, state.checkpoint.as_str());
    }
}

/// Locks a mutex whose data stays consistent even if a holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
