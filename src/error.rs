//! Error types shared across the crate.
//!
//! Transport faults are deliberately absent here: an unreachable peer is an
//! expected condition and travels as `None` through the transport API.

/// Wire text that could not be decoded into a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty request")]
    Empty,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("missing argument for {0}")]
    MissingArgument(&'static str),

    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("malformed {what}: {text:?}")]
    Malformed { what: &'static str, text: String },
}

/// Invariant breaches after which a node must stop rather than diverge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("replicas report different in-flight requests: {0:?}")]
    DivergentInFlight(Vec<String>),

    #[error("replicas report different previously committed requests: {0:?}")]
    DivergentPrevious(Vec<String>),

    #[error("replicas answered the same request differently: {0:?}")]
    DivergentResponses(Vec<String>),
}

/// Stops the process after a protocol violation.
pub fn halt(violation: ProtocolViolation) -> ! {
    tracing::error!("Protocol violation, halting node: {}", violation);
    std::process::exit(1)
}
