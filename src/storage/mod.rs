//! Storage Module
//!
//! The in-memory key-counter store every replica holds.
//!
//! ## Core Concepts
//! - **Store**: Keys map to signed counters. Only `Get`, `Increment` and `Decrement` exist; keys are
//!   never created by a request, so unknown keys answer "No such key.".
//! - **Checkpoint**: A serialized snapshot of the store, replaced on a fixed timer.
//! - **Operation Log**: Requests applied since the checkpoint. Checkpoint plus log rebuild the
//!   current store on a peer that joins late.

pub mod memory;
