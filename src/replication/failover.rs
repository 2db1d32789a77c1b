//! Reconciliation of a request left in doubt by a crashed active primary.
//!
//! The new primary asks every member for its `Current` request (voted on but
//! not yet decided). Members reporting one are busy, the others are free.
//! Since at most one request is in flight cluster-wide, all busy members must
//! agree on it. If some members are already free, their `Previous` request
//! tells whether the old primary got as far as sending `Do`.

use std::collections::BTreeSet;

use crate::error::ProtocolViolation;
use crate::membership::types::NodeId;
use crate::transport::protocol::{NO_REQUEST, UserRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub request: Option<UserRequest>,
    pub busy: Vec<NodeId>,
    pub free: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing was committed anywhere; pending requests are simply voted again.
    Nothing,
    /// The request was committed on some members; finish it on `targets`.
    Reissue {
        request: UserRequest,
        targets: Vec<NodeId>,
    },
    /// Ask the free members what they committed last.
    ComparePrevious,
}

/// Decodes an answer to `Current` or `Previous`.
pub fn parse_slot(answer: &str) -> Option<UserRequest> {
    if answer == NO_REQUEST {
        return None;
    }
    match answer.parse() {
        Ok(request) => Some(request),
        Err(e) => {
            tracing::warn!("Ignoring undecodable request slot {:?}: {}", answer, e);
            None
        }
    }
}

/// Splits reachable members into busy and free.
pub fn classify(
    slots: impl IntoIterator<Item = (NodeId, Option<UserRequest>)>,
) -> Result<InFlight, ProtocolViolation> {
    let mut busy = Vec::new();
    let mut free = Vec::new();
    let mut distinct = BTreeSet::new();
    let mut request = None;

    for (member, slot) in slots {
        match slot {
            Some(current) => {
                busy.push(member);
                distinct.insert(current.to_string());
                request = Some(current);
            }
            None => free.push(member),
        }
    }

    if distinct.len() > 1 {
        return Err(ProtocolViolation::DivergentInFlight(distinct.into_iter().collect()));
    }

    Ok(InFlight { request, busy, free })
}

pub fn plan(in_flight: &InFlight) -> Decision {
    match &in_flight.request {
        None => Decision::Nothing,
        Some(request) if in_flight.free.is_empty() => Decision::Reissue {
            request: request.clone(),
            targets: in_flight.busy.clone(),
        },
        Some(_) => Decision::ComparePrevious,
    }
}

/// Final decision once the free members reported their `Previous` request.
pub fn resolve_previous(
    in_flight: &InFlight,
    previous: impl IntoIterator<Item = Option<UserRequest>>,
) -> Result<Decision, ProtocolViolation> {
    let Some(request) = &in_flight.request else {
        return Ok(Decision::Nothing);
    };

    let distinct: BTreeSet<String> = previous
        .into_iter()
        .flatten()
        .map(|committed| committed.to_string())
        .collect();

    if distinct.len() > 1 {
        return Err(ProtocolViolation::DivergentPrevious(distinct.into_iter().collect()));
    }

    if distinct.contains(&request.to_string()) {
        Ok(Decision::Reissue {
            request: request.clone(),
            targets: in_flight.busy.clone(),
        })
    } else {
        Ok(Decision::Nothing)
    }
}
