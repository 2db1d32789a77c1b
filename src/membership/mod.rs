//! Membership & Failure Detection Module
//!
//! Decides which replicas are alive and publishes the ordered membership list.
//!
//! ## Core Mechanisms
//! - **Detection Tree**: Every node has configured parents and children. Children push UDP
//!   heartbeats upward; parents keep a tolerance counter per child and relay `Alive`/`Dead`
//!   transitions toward the root over reliable requests.
//! - **Edge Triggering**: A transition is reported once when it happens, never once per tick
//!   or once per heartbeat.
//! - **Authority**: The root owns the insertion-ordered membership list and broadcasts the whole
//!   list on every change. Slot 0 is the primary.

pub mod authority;
pub mod detector;
pub mod types;

#[cfg(test)]
mod tests;
