//! Property-based tests for the prune pass.
//!
//! These verify the coalescing guarantees for ALL request sequences, not just
//! the hand-written cases in the unit tests: nothing is lost, every pruned
//! request points at a survivor, and the survivors never contain redundant
//! transitions for the same resource.

use std::collections::HashSet;

use coalesce_core::{
    Fate, OpenRequest, Queued, Request, ResourceHandle, ResourceId, Ticket, prune,
};
use proptest::prelude::*;

/// Strategy for a resource id from a small pool, so collisions are common
fn resource_id() -> impl Strategy<Value = ResourceId> {
    (0u32..4).prop_map(ResourceId)
}

/// Strategy for generating arbitrary requests
fn request_strategy() -> impl Strategy<Value = Request> {
    prop_oneof![
        4 => resource_id().prop_map(|id| Request::Open(OpenRequest::new(id))),
        2 => (resource_id(), prop::collection::vec(resource_id(), 1..3))
            .prop_map(|(id, shared)| Request::Open(OpenRequest::shared(id, shared))),
        1 => resource_id().prop_map(|id| Request::Open(OpenRequest::prewarm(id))),
        3 => resource_id().prop_map(Request::CloseById),
        1 => Just(Request::CloseAll),
        2 => (resource_id(), 0u64..3)
            .prop_map(|(id, generation)| Request::Close(ResourceHandle { id, generation })),
    ]
}

/// Strategy for a batch with tickets in arrival order
fn batch_strategy() -> impl Strategy<Value = Vec<Queued>> {
    prop::collection::vec(request_strategy(), 0..24).prop_map(|requests| {
        requests
            .into_iter()
            .enumerate()
            .map(|(i, request)| Queued::new(Ticket(i as u64), request))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Property: every ticket comes out exactly once
    #[test]
    fn prop_every_ticket_accounted_for(batch in batch_strategy()) {
        let expected: HashSet<Ticket> = batch.iter().map(|q| q.ticket).collect();
        let plan = prune(batch.clone());

        let mut seen = HashSet::new();
        for ticket in plan.survivors.iter().map(|q| q.ticket).chain(plan.pruned.iter().map(|p| p.ticket)) {
            prop_assert!(seen.insert(ticket), "ticket {} emitted twice", ticket);
        }
        prop_assert_eq!(seen, expected);
    }

    /// Property: pruned requests always chain to a surviving request
    #[test]
    fn prop_pruned_point_at_survivors(batch in batch_strategy()) {
        let plan = prune(batch);
        let survivors: HashSet<Ticket> = plan.survivors.iter().map(|q| q.ticket).collect();

        for pruned in &plan.pruned {
            prop_assert!(survivors.contains(&pruned.superseded_by));
            let expected = match pruned.request {
                Request::Open(_) => Fate::Disconnect,
                _ => Fate::Chain,
            };
            prop_assert_eq!(pruned.fate, expected);
        }
    }

    /// Property: at most one open and one close-by-id per resource survive,
    /// and a surviving close always runs before a surviving open involving it
    #[test]
    fn prop_one_transition_per_resource(batch in batch_strategy()) {
        let plan = prune(batch);

        let mut opened = HashSet::new();
        let mut closed = HashSet::new();
        for queued in &plan.survivors {
            match &queued.request {
                Request::Open(open) => prop_assert!(opened.insert(open.resource)),
                Request::CloseById(id) => prop_assert!(closed.insert(*id)),
                Request::CloseAll | Request::Close(_) => {},
            }
        }

        for (close_index, queued) in plan.survivors.iter().enumerate() {
            let Request::CloseById(id) = queued.request else { continue };
            for (open_index, other) in plan.survivors.iter().enumerate() {
                if let Request::Open(open) = &other.request
                    && open.involves(id)
                {
                    prop_assert!(close_index < open_index);
                }
            }
        }
    }

    /// Property: a surviving close-all runs first, and handle closes precede
    /// everything else otherwise
    #[test]
    fn prop_close_ordering(batch in batch_strategy()) {
        let plan = prune(batch);

        let close_alls: Vec<usize> = plan
            .survivors
            .iter()
            .enumerate()
            .filter(|(_, q)| q.request == Request::CloseAll)
            .map(|(i, _)| i)
            .collect();
        prop_assert!(close_alls.len() <= 1);
        if let Some(&index) = close_alls.first() {
            prop_assert_eq!(index, 0);
        }

        let first_other = plan
            .survivors
            .iter()
            .position(|q| !matches!(q.request, Request::Close(_)))
            .unwrap_or(plan.survivors.len());
        prop_assert!(
            plan.survivors[first_other..].iter().all(|q| !matches!(q.request, Request::Close(_)))
        );
    }

    /// Property: survivors keep their relative arrival order, apart from
    /// handle closes moving to the front
    #[test]
    fn prop_survivors_keep_order(batch in batch_strategy()) {
        let plan = prune(batch);

        let rest: Vec<Ticket> = plan
            .survivors
            .iter()
            .filter(|q| !matches!(q.request, Request::Close(_)))
            .map(|q| q.ticket)
            .collect();
        prop_assert!(rest.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn repeated_open_only_last_takes_effect() {
    let batch = vec![
        Queued::new(Ticket(0), Request::Open(OpenRequest::new(ResourceId(1)))),
        Queued::new(Ticket(1), Request::Open(OpenRequest::new(ResourceId(1)))),
    ];

    let plan = prune(batch);

    assert_eq!(plan.survivors.len(), 1);
    assert_eq!(plan.survivors[0].ticket, Ticket(1));
    assert_eq!(plan.pruned[0].fate, Fate::Disconnect);
}
