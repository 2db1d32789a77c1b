use crate::error::DecodeError;
use crate::transport::protocol::{Operation, UserRequest};

use std::collections::BTreeMap;

/// Key to integer counter mapping held by every replica.
///
/// Missing keys are never created implicitly: `Increment`/`Decrement` of an
/// unknown key leave the store untouched and report `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueStore {
    entries: BTreeMap<String, i64>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn increment(&mut self, key: &str) -> Option<i64> {
        let value = self.entries.get_mut(key)?;
        *value += 1;
        Some(*value)
    }

    pub fn decrement(&mut self, key: &str) -> Option<i64> {
        let value = self.entries.get_mut(key)?;
        *value -= 1;
        Some(*value)
    }

    /// Applies one operation and returns the post-operation value.
    pub fn apply(&mut self, operation: Operation, key: &str) -> Option<i64> {
        match operation {
            Operation::Get => self.get(key),
            Operation::Increment => self.increment(key),
            Operation::Decrement => self.decrement(key),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Wire form `key1,value1,key2,value2,...`; the empty store is `""`.
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{},{}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn deserialize(text: &str) -> Result<Self, DecodeError> {
        let mut entries = BTreeMap::new();
        if text.is_empty() {
            return Ok(Self { entries });
        }

        let parts: Vec<&str> = text.split(',').collect();
        if parts.len() % 2 != 0 {
            return Err(DecodeError::Malformed {
                what: "store",
                text: text.to_string(),
            });
        }

        for pair in parts.chunks(2) {
            let value = pair[1]
                .parse::<i64>()
                .map_err(|_| DecodeError::InvalidNumber {
                    field: "store value",
                    value: pair[1].to_string(),
                })?;
            entries.insert(pair[0].to_string(), value);
        }

        Ok(Self { entries })
    }
}

/// Immutable serialized snapshot of a `KeyValueStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn capture(store: &KeyValueStore) -> Self {
        Self(store.serialize())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn restore(&self) -> Result<KeyValueStore, DecodeError> {
        KeyValueStore::deserialize(&self.0)
    }
}

/// Store, checkpoint and the log of requests applied since that checkpoint.
///
/// Kept behind one lock so that a rotation observes either all or none of a
/// request's effects.
#[derive(Debug, Clone)]
pub struct StoreState {
    pub store: KeyValueStore,
    pub checkpoint: Checkpoint,
    pub log: Vec<UserRequest>,
}

impl StoreState {
    pub fn new(store: KeyValueStore) -> Self {
        let checkpoint = Checkpoint::capture(&store);
        Self {
            store,
            checkpoint,
            log: Vec::new(),
        }
    }

    /// Executes a request and appends it to the log. Reads are logged too so
    /// that replaying the log on a peer visits the same requests.
    pub fn execute(&mut self, request: &UserRequest) -> Option<i64> {
        let value = self.store.apply(request.operation, &request.key);
        self.log.push(request.clone());
        value
    }

    /// Applies only the mutation of a request, without producing a response.
    pub fn reapply(&mut self, request: &UserRequest) {
        if request.operation.is_mutating() {
            self.store.apply(request.operation, &request.key);
        }
        self.log.push(request.clone());
    }

    /// Replaces the checkpoint with the current store and truncates the log.
    pub fn rotate(&mut self) {
        self.checkpoint = Checkpoint::capture(&self.store);
        self.log.clear();
    }

    /// Installs a store received from a peer and makes it the new checkpoint.
    pub fn install(&mut self, store: KeyValueStore) {
        self.store = store;
        self.rotate();
    }
}
