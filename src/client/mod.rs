//! Client Module
//!
//! Issues Get/Increment/Decrement against the replicated store.
//!
//! ## Core Concepts
//! - **Discovery**: The membership list is pulled from the authority before every operation.
//!   An empty list means no server is available.
//! - **Timestamps**: Wall-clock milliseconds, strictly increasing per client, so the pair
//!   (client, timestamp) identifies a request.
//! - **Strategies**: `ActiveClient` sends to every member and checks agreement; `PassiveClient`
//!   goes through the primary and forwards writes to the backups.


use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ProtocolViolation, halt};
use crate::membership::types::NodeId;
use crate::replication::core::lock;
use crate::transport::protocol::{
    ABORTED, ACK, ClientOp, NO_SERVER, Operation, Request, split_members,
};
use crate::transport::{GroupResponses, Transport};

/// How often an aborted request is re-sent before the abort is returned.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[async_trait]
pub trait Client: Send + Sync {
    async fn execute(&self, operation: Operation, key: &str) -> String;

    async fn get(&self, key: &str) -> String {
        self.execute(Operation::Get, key).await
    }

    async fn increment(&self, key: &str) -> String {
        self.execute(Operation::Increment, key).await
    }

    async fn decrement(&self, key: &str) -> String {
        self.execute(Operation::Decrement, key).await
    }
}

/// Membership lookup and timestamping shared by both strategies.
pub struct ClientCore {
    transport: Arc<dyn Transport>,
    authority: NodeId,
    last_timestamp: Mutex<u64>,
}

impl ClientCore {
    pub fn new(transport: Arc<dyn Transport>, authority: NodeId) -> Self {
        Self {
            transport,
            authority,
            last_timestamp: Mutex::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        self.transport.local_id()
    }

    pub async fn membership(&self) -> Vec<NodeId> {
        match self
            .transport
            .send_request(&self.authority, &Request::MembershipQuery)
            .await
        {
            Some(list) => split_members(&list),
            None => {
                tracing::warn!("Membership authority {} is unreachable", self.authority);
                Vec::new()
            }
        }
    }

    pub fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default();

        let mut last = lock(&self.last_timestamp);
        *last = now.max(*last + 1);
        *last
    }

    fn operation(&self, operation: Operation, key: &str) -> ClientOp {
        ClientOp {
            operation,
            key: key.to_string(),
            timestamp: self.next_timestamp(),
        }
    }
}

/// The single response all reachable replicas agree on, `None` if none answered.
pub fn check_agreement(responses: &GroupResponses) -> Result<Option<String>, ProtocolViolation> {
    let distinct: BTreeSet<&String> = responses.values().flatten().collect();

    match distinct.len() {
        0 => Ok(None),
        1 => Ok(distinct.into_iter().next().cloned()),
        _ => Err(ProtocolViolation::DivergentResponses(
            distinct.into_iter().cloned().collect(),
        )),
    }
}

pub struct ActiveClient {
    core: ClientCore,
    max_attempts: usize,
}

impl ActiveClient {
    pub fn new(transport: Arc<dyn Transport>, authority: NodeId) -> Self {
        Self {
            core: ClientCore::new(transport, authority),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[async_trait]
impl Client for ActiveClient {
    async fn execute(&self, operation: Operation, key: &str) -> String {
        let mut outcome = ABORTED.to_string();

        for attempt in 1..=self.max_attempts {
            let members = self.core.membership().await;
            if members.is_empty() {
                return NO_SERVER.to_string();
            }

            let op = self.core.operation(operation, key);
            let responses = self
                .core
                .transport
                .send_request_to_group(&members, &Request::Client(op.clone()))
                .await;

            outcome = match check_agreement(&responses) {
                Ok(Some(response)) => response,
                Ok(None) => return NO_SERVER.to_string(),
                Err(violation) => halt(violation),
            };

            if outcome != ABORTED {
                break;
            }
            tracing::info!("{} aborted (attempt {}/{})", op, attempt, self.max_attempts);
        }

        outcome
    }
}

pub struct PassiveClient {
    core: ClientCore,
    primary: Mutex<Option<NodeId>>,
}

impl PassiveClient {
    pub fn new(transport: Arc<dyn Transport>, authority: NodeId) -> Self {
        Self {
            core: ClientCore::new(transport, authority),
            primary: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Client for PassiveClient {
    async fn execute(&self, operation: Operation, key: &str) -> String {
        let members = self.core.membership().await;
        let Some((primary, backups)) = members.split_first() else {
            return NO_SERVER.to_string();
        };
        let transport = &self.core.transport;

        let known = lock(&self.primary).clone();
        if known.as_ref() != Some(primary) {
            tracing::info!("{} waits for primary {} to take over", self.core.id(), primary);
            match transport.send_request(primary, &Request::Upgraded).await.as_deref() {
                Some(ACK) => *lock(&self.primary) = Some(primary.clone()),
                Some(refusal) => {
                    tracing::warn!("{} refused to take over: {}", primary, refusal);
                    return NO_SERVER.to_string();
                }
                None => return NO_SERVER.to_string(),
            }
        }

        let op = self.core.operation(operation, key);
        let Some(response) = transport.send_request(primary, &Request::Client(op.clone())).await else {
            return NO_SERVER.to_string();
        };

        if operation.is_mutating() {
            transport
                .send_request_to_group(backups, &Request::Client(op))
                .await;
        }

        response
    }
}
