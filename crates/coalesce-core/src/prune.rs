//! Prune pass over a batch of queued requests.
//!
//! Runs once per processing cycle on everything accumulated since the last
//! one. The pass is pure: it decides which requests survive and what happens
//! to the callers of the ones that don't, and leaves execution to the
//! worker.
//!
//! Rules, applied in order:
//!
//! 1. Explicit `Close(handle)` requests move to the front, keeping their
//!    arrival order.
//! 2. The last `CloseAll` drops everything queued before it.
//! 3. An `Open` is dropped when a later request closes one of its
//!    participants, opens the same resource again, or opens with a different
//!    co-owned set.
//! 4. A `CloseById` is dropped when a later `CloseById` targets the same
//!    resource.
//!
//! Prewarms are opens for every rule above, so a later prewarm of the same
//! id drops an earlier open and disconnects its caller.
//!
//! Dropped opens disconnect their caller. Dropped close-type requests chain
//! their completion onto the request that superseded them, which always
//! survives.

use crate::request::{OpenRequest, Queued, Request, Ticket};

/// What happens to the caller of a pruned request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    /// Open caller is disconnected without error
    Disconnect,
    /// Completion resolves together with the superseding request
    Chain,
}

/// A request removed by the prune pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pruned {
    /// Ticket of the removed request
    pub ticket: Ticket,
    /// The removed request
    pub request: Request,
    /// Surviving request that made this one redundant
    pub superseded_by: Ticket,
    /// How the removed request's caller is settled
    pub fate: Fate,
}

impl Pruned {
    fn new(queued: Queued, superseded_by: Ticket) -> Self {
        let fate = match queued.request {
            Request::Open(_) => Fate::Disconnect,
            Request::CloseById(_) | Request::CloseAll | Request::Close(_) => Fate::Chain,
        };
        tracing::debug!(
            ticket = %queued.ticket,
            superseded_by = %superseded_by,
            kind = queued.request.kind(),
            "request pruned"
        );
        Self { ticket: queued.ticket, request: queued.request, superseded_by, fate }
    }
}

/// Result of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    /// Requests to execute, in order
    pub survivors: Vec<Queued>,
    /// Requests removed, in the order they were decided
    pub pruned: Vec<Pruned>,
}

/// Coalesce a batch of requests given in arrival order.
///
/// Every input ticket ends up in exactly one of [`PrunePlan::survivors`] or
/// [`PrunePlan::pruned`], and every `superseded_by` names a survivor.
pub fn prune(batch: Vec<Queued>) -> PrunePlan {
    let mut pruned = Vec::new();

    let (mut requests, rest): (Vec<Queued>, Vec<Queued>) =
        batch.into_iter().partition(|queued| matches!(queued.request, Request::Close(_)));
    requests.extend(rest);

    if let Some(index) = requests.iter().rposition(|queued| queued.request == Request::CloseAll)
        && index > 0
    {
        let close_all = requests[index].ticket;
        pruned.extend(requests.drain(..index).map(|queued| Pruned::new(queued, close_all)));
    }

    let decisions: Vec<Option<Ticket>> = requests
        .iter()
        .enumerate()
        .map(|(index, queued)| superseded_by(&queued.request, &requests[index + 1..]))
        .collect();

    let mut survivors = Vec::with_capacity(requests.len());
    for (queued, decision) in requests.into_iter().zip(decisions) {
        match decision {
            Some(by) => pruned.push(Pruned::new(queued, by)),
            None => survivors.push(queued),
        }
    }

    PrunePlan { survivors, pruned }
}

/// Ticket of the later request that makes `request` redundant, if any.
fn superseded_by(request: &Request, later: &[Queued]) -> Option<Ticket> {
    match request {
        Request::Open(open) => {
            later.iter().find(|queued| supersedes_open(open, &queued.request)).map(|q| q.ticket)
        },
        // The last close of the same id survives, so chain straight to it.
        Request::CloseById(id) => later
            .iter()
            .rev()
            .find(|queued| queued.request == Request::CloseById(*id))
            .map(|q| q.ticket),
        Request::CloseAll | Request::Close(_) => None,
    }
}

fn supersedes_open(open: &OpenRequest, later: &Request) -> bool {
    match later {
        Request::CloseById(id) => open.involves(*id),
        Request::Open(other) => other.resource == open.resource || other.shared != open.shared,
        Request::CloseAll | Request::Close(_) => false,
    }
}
