//! Replicated Counter Store Library
//!
//! Core modules of a small replicated key-counter store used to compare replication strategies.
//! The binary (`main.rs`) wires them into one process per node.
//!
//! ## Architecture Modules
//!
//! - **`membership`**: Hierarchical heartbeat failure detection and the membership authority
//!   that publishes the ordered list of alive replicas.
//! - **`replication`**: Active (unanimous vote) and passive (primary-backup) replication on top
//!   of a shared replica core, including failover and state transfer.
//! - **`storage`**: The key-counter store with its checkpoint and operation log.
//! - **`transport`**: Request vocabulary, the `Transport`/`Endpoint` seams, the HTTP+UDP transport
//!   and an in-process network for tests.
//! - **`client`**: Client strategies matching each replication mode.
//! - **`node`**: Composition of detector and role behind a single endpoint.

pub mod client;
pub mod config;
pub mod error;
pub mod membership;
pub mod node;
pub mod replication;
pub mod storage;
pub mod transport;
