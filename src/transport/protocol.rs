//! Application Request Vocabulary
//!
//! Every message between nodes is a line of text `Op|args`. The text form is
//! decoded exactly once, at the transport boundary, into [`Request`]; the rest
//! of the crate only sees the typed variants.
//!
//! Keys and node ids must not contain any of `,` `|` `;` `&`, which delimit
//! the wire forms below.

use crate::error::DecodeError;
use crate::membership::types::NodeId;
use crate::storage::memory::KeyValueStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// --- API Endpoints ---

/// Endpoint accepting one reliable request and returning its response text.
pub const ENDPOINT_RPC: &str = "/rpc";

// --- Response Text ---

pub const ACK: &str = "ACK";
pub const YES: &str = "Yes";
pub const NO: &str = "No";
pub const NO_SUCH_KEY: &str = "No such key.";
pub const NO_SERVER: &str = "Error: No server is available!";
pub const ABORTED: &str = "Error: Request aborted.";
pub const NOT_AUTHORITY: &str = "Error: Not the membership authority!";
pub const NOT_REPLICA: &str = "Error: Not a replica!";
pub const NOT_PRIMARY: &str = "Error: Not the primary!";
/// Answer to `Current` / `Previous` when there is no such request.
pub const NO_REQUEST: &str = "None";

/// Renders the outcome of a client operation.
pub fn render_value(value: Option<i64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => NO_SUCH_KEY.to_string(),
    }
}

// --- Data Transfer Objects ---

/// Body of `POST /rpc`: the sender's id and the request wire text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub source: NodeId,
    pub payload: String,
}

/// Response to an [`RpcEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub body: String,
}

// --- Requests ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Increment,
    Decrement,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "Get",
            Operation::Increment => "Increment",
            Operation::Decrement => "Decrement",
        }
    }

    pub fn is_mutating(self) -> bool {
        !matches!(self, Operation::Get)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Get" => Some(Operation::Get),
            "Increment" => Some(Operation::Increment),
            "Decrement" => Some(Operation::Decrement),
            _ => None,
        }
    }
}

/// Client operation as sent by a client: `Op|key,timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientOp {
    pub operation: Operation,
    pub key: String,
    pub timestamp: u64,
}

impl ClientOp {
    /// Binds the operation to the client that issued it.
    pub fn from_client(self, source: NodeId) -> UserRequest {
        UserRequest {
            source,
            operation: self.operation,
            key: self.key,
            timestamp: self.timestamp,
        }
    }

    fn decode(operation: Operation, args: &str) -> Result<Self, DecodeError> {
        let (key, timestamp) = args.split_once(',').ok_or_else(|| DecodeError::Malformed {
            what: "client operation",
            text: args.to_string(),
        })?;
        Ok(Self {
            operation,
            key: key.to_string(),
            timestamp: parse_number(timestamp, "timestamp")?,
        })
    }
}

impl fmt::Display for ClientOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{},{}", self.operation.name(), self.key, self.timestamp)
    }
}

/// A client operation bound to its client: `Op|key,timestamp,source`.
///
/// The full tuple identifies the request; timestamps are unique per client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserRequest {
    pub source: NodeId,
    pub operation: Operation,
    pub key: String,
    pub timestamp: u64,
}

impl fmt::Display for UserRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{},{},{}",
            self.operation.name(),
            self.key,
            self.timestamp,
            self.source
        )
    }
}

impl FromStr for UserRequest {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = || DecodeError::Malformed {
            what: "user request",
            text: text.to_string(),
        };

        let (name, args) = text.split_once('|').ok_or_else(malformed)?;
        let operation =
            Operation::parse(name).ok_or_else(|| DecodeError::UnknownOperation(name.to_string()))?;

        let fields: Vec<&str> = args.split(',').collect();
        let [key, timestamp, source] = fields.as_slice() else {
            return Err(malformed());
        };

        Ok(Self {
            source: NodeId::new(*source),
            operation,
            key: key.to_string(),
            timestamp: parse_number(timestamp, "timestamp")?,
        })
    }
}

/// Payload a passive primary pushes to its backups:
/// `Checkpoint|<store>|<client1>,<timestamp1>,...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPayload {
    pub store: KeyValueStore,
    /// Latest executed timestamp per client since the previous checkpoint.
    pub timestamps: BTreeMap<NodeId, u64>,
}

impl CheckpointPayload {
    fn encode_timestamps(&self) -> String {
        self.timestamps
            .iter()
            .map(|(client, ts)| format!("{},{}", client, ts))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn decode(args: &str) -> Result<Self, DecodeError> {
        let (store, timestamps) = args.split_once('|').ok_or_else(|| DecodeError::Malformed {
            what: "checkpoint",
            text: args.to_string(),
        })?;

        let mut decoded = BTreeMap::new();
        if !timestamps.is_empty() {
            let parts: Vec<&str> = timestamps.split(',').collect();
            if parts.len() % 2 != 0 {
                return Err(DecodeError::Malformed {
                    what: "checkpoint timestamps",
                    text: timestamps.to_string(),
                });
            }
            for pair in parts.chunks(2) {
                decoded.insert(NodeId::new(pair[0]), parse_number(pair[1], "timestamp")?);
            }
        }

        Ok(Self {
            store: KeyValueStore::deserialize(store)?,
            timestamps: decoded,
        })
    }
}

/// Answer to `Restore`: `<checkpoint>&<log>&<pending>`, where log and pending
/// are `;`-separated user requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSnapshot {
    pub checkpoint: KeyValueStore,
    pub log: Vec<UserRequest>,
    pub pending: Vec<UserRequest>,
}

impl RestoreSnapshot {
    pub fn encode(&self) -> String {
        format!(
            "{}&{}&{}",
            self.checkpoint.serialize(),
            join_requests(&self.log),
            join_requests(&self.pending)
        )
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let parts: Vec<&str> = text.split('&').collect();
        let [checkpoint, log, pending] = parts.as_slice() else {
            return Err(DecodeError::Malformed {
                what: "restore snapshot",
                text: text.to_string(),
            });
        };

        Ok(Self {
            checkpoint: KeyValueStore::deserialize(checkpoint)?,
            log: split_requests(log)?,
            pending: split_requests(pending)?,
        })
    }
}

fn join_requests(requests: &[UserRequest]) -> String {
    requests
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

fn split_requests(text: &str) -> Result<Vec<UserRequest>, DecodeError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(';').map(UserRequest::from_str).collect()
}

fn parse_number<T: FromStr>(text: &str, field: &'static str) -> Result<T, DecodeError> {
    text.trim().parse().map_err(|_| DecodeError::InvalidNumber {
        field,
        value: text.to_string(),
    })
}

/// Every request a node can receive over the reliable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // Failure detection
    Alive(NodeId),
    Dead(NodeId),
    HeartbeatInterval(i64),
    HeartbeatTolerance(i64),

    // Membership
    /// Client pull query, answered with the current ordered list.
    MembershipQuery,
    /// Authority broadcast of the full ordered list.
    Membership(Vec<NodeId>),
    CheckpointInterval(i64),

    // Client operations
    Client(ClientOp),

    // Active replication
    Vote(UserRequest),
    Do(UserRequest),
    GiveUp(UserRequest),
    Block,
    Unblock,
    Restore,
    Current,
    Previous,

    // Passive replication
    Checkpoint(CheckpointPayload),
    Upgraded,
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Alive(node) => write!(f, "Alive|{}", node),
            Request::Dead(node) => write!(f, "Dead|{}", node),
            Request::HeartbeatInterval(ms) => write!(f, "HeartbeatInterval|{}", ms),
            Request::HeartbeatTolerance(n) => write!(f, "HeartbeatTolerance|{}", n),
            Request::MembershipQuery => f.write_str("Membership"),
            Request::Membership(members) => write!(f, "Membership|{}", join_members(members)),
            Request::CheckpointInterval(ms) => write!(f, "CheckpointInterval|{}", ms),
            Request::Client(op) => write!(f, "{}", op),
            Request::Vote(request) => write!(f, "Vote|{}", request),
            Request::Do(request) => write!(f, "Do|{}", request),
            Request::GiveUp(request) => write!(f, "GiveUp|{}", request),
            Request::Block => f.write_str("Block"),
            Request::Unblock => f.write_str("Unblock"),
            Request::Restore => f.write_str("Restore"),
            Request::Current => f.write_str("Current"),
            Request::Previous => f.write_str("Previous"),
            Request::Checkpoint(payload) => write!(
                f,
                "Checkpoint|{}|{}",
                payload.store.serialize(),
                payload.encode_timestamps()
            ),
            Request::Upgraded => f.write_str("Upgraded"),
        }
    }
}

impl FromStr for Request {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (name, args) = match text.split_once('|') {
            Some((name, args)) => (name, Some(args)),
            None => (text, None),
        };
        let required = |field: &'static str| args.ok_or(DecodeError::MissingArgument(field));

        let request = match name {
            "Alive" => Request::Alive(NodeId::new(required("Alive")?)),
            "Dead" => Request::Dead(NodeId::new(required("Dead")?)),
            "HeartbeatInterval" => Request::HeartbeatInterval(parse_number(
                required("HeartbeatInterval")?,
                "heartbeat interval",
            )?),
            "HeartbeatTolerance" => Request::HeartbeatTolerance(parse_number(
                required("HeartbeatTolerance")?,
                "heartbeat tolerance",
            )?),
            "Membership" => match args {
                None => Request::MembershipQuery,
                Some(list) => Request::Membership(split_members(list)),
            },
            "CheckpointInterval" => Request::CheckpointInterval(parse_number(
                required("CheckpointInterval")?,
                "checkpoint interval",
            )?),
            "Get" | "Increment" | "Decrement" => {
                let operation = Operation::parse(name)
                    .ok_or_else(|| DecodeError::UnknownOperation(name.to_string()))?;
                Request::Client(ClientOp::decode(operation, required("client operation")?)?)
            }
            "Vote" => Request::Vote(required("Vote")?.parse()?),
            "Do" => Request::Do(required("Do")?.parse()?),
            "GiveUp" => Request::GiveUp(required("GiveUp")?.parse()?),
            "Block" => Request::Block,
            "Unblock" => Request::Unblock,
            "Restore" => Request::Restore,
            "Current" => Request::Current,
            "Previous" => Request::Previous,
            "Checkpoint" => Request::Checkpoint(CheckpointPayload::decode(required("Checkpoint")?)?),
            "Upgraded" => Request::Upgraded,
            other => return Err(DecodeError::UnknownOperation(other.to_string())),
        };

        Ok(request)
    }
}

pub fn join_members(members: &[NodeId]) -> String {
    members
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn split_members(list: &str) -> Vec<NodeId> {
    list.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(NodeId::new)
        .collect()
}
