//! Fuzz target for the prune pass
//!
//! # Strategy
//!
//! - Arbitrary batches over a handful of resource ids so requests collide
//! - Every request kind, including group opens and stale handle closes
//!
//! # Invariants
//!
//! - Every ticket ends up exactly once, as survivor or pruned
//! - Pruned requests point at a survivor
//! - At most one open and one close-by-id per resource survive
//! - A surviving close-by-id precedes any surviving open involving its id
//! - A surviving close-all is the first request executed

#![no_main]

use std::collections::{BTreeMap, BTreeSet};

use arbitrary::Arbitrary;
use coalesce_core::{
    Fate, OpenRequest, Queued, Request, ResourceHandle, ResourceId, Ticket, prune,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum FuzzRequest {
    Open(u8),
    OpenShared(u8, Vec<u8>),
    Prewarm(u8),
    CloseById(u8),
    CloseAll,
    Close { id: u8, generation: u8 },
}

fn id(raw: u8) -> ResourceId {
    ResourceId(u32::from(raw % 6))
}

fn to_request(request: &FuzzRequest) -> Request {
    match request {
        FuzzRequest::Open(n) => Request::Open(OpenRequest::new(id(*n))),
        FuzzRequest::OpenShared(n, with) => {
            Request::Open(OpenRequest::shared(id(*n), with.iter().take(4).map(|w| id(*w))))
        },
        FuzzRequest::Prewarm(n) => Request::Open(OpenRequest::prewarm(id(*n))),
        FuzzRequest::CloseById(n) => Request::CloseById(id(*n)),
        FuzzRequest::CloseAll => Request::CloseAll,
        FuzzRequest::Close { id: n, generation } => {
            Request::Close(ResourceHandle { id: id(*n), generation: u64::from(*generation) })
        },
    }
}

fuzz_target!(|requests: Vec<FuzzRequest>| {
    let batch: Vec<Queued> = requests
        .iter()
        .take(64)
        .enumerate()
        .map(|(n, r)| Queued::new(Ticket(n as u64), to_request(r)))
        .collect();
    let total = batch.len();

    let plan = prune(batch);

    let mut seen = BTreeSet::new();
    for ticket in plan.survivors.iter().map(|q| q.ticket).chain(plan.pruned.iter().map(|p| p.ticket)) {
        assert!(seen.insert(ticket), "ticket {ticket} appears twice");
    }
    assert_eq!(seen.len(), total);

    let survivors: BTreeSet<Ticket> = plan.survivors.iter().map(|q| q.ticket).collect();
    for pruned in &plan.pruned {
        assert!(survivors.contains(&pruned.superseded_by), "{pruned:?} chained to a pruned request");
        let expected = match pruned.request {
            Request::Open(_) => Fate::Disconnect,
            _ => Fate::Chain,
        };
        assert_eq!(pruned.fate, expected);
    }

    let mut opens = BTreeMap::new();
    let mut closes = BTreeMap::new();
    for (position, queued) in plan.survivors.iter().enumerate() {
        match &queued.request {
            Request::Open(open) => {
                assert!(opens.insert(open.resource, position).is_none(), "two opens of {}", open.resource);
            },
            Request::CloseById(id) => {
                assert!(closes.insert(*id, position).is_none(), "two closes of {id}");
            },
            Request::CloseAll => assert_eq!(position, 0, "close-all survived behind other requests"),
            Request::Close(_) => {},
        }
    }
    for queued in &plan.survivors {
        if let Request::Open(open) = &queued.request {
            let open_at = opens[&open.resource];
            for participant in open.participants() {
                if let Some(close_at) = closes.get(&participant) {
                    assert!(*close_at < open_at, "close of {participant} after open of {}", open.resource);
                }
            }
        }
    }
});
