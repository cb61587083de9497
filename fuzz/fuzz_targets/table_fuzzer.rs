//! Fuzz target for the resource table
//!
//! Drives the table the way the worker does: plan, close conflicts, open,
//! admit, and release, with arbitrary open failures and clock jumps.
//!
//! # Invariants
//!
//! - The standard harness invariants hold after every operation
//! - Expired resources are always idle
//! - Close-all leaves nothing behind

#![no_main]

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use coalesce_core::{LeaseId, OpenRequest, ResourceId, ResourceTable, Ticket};
use coalesce_harness::{InvariantRegistry, SystemSnapshot};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum TableOp {
    Open { id: u8, with: Vec<u8>, prewarm: bool, fails: bool },
    CloseById(u8),
    CloseAll,
    Release(u8),
    Advance(u16),
    Expire,
}

fn id(raw: u8) -> ResourceId {
    ResourceId(u32::from(raw % 5))
}

fuzz_target!(|ops: Vec<TableOp>| {
    let idle = Duration::from_millis(3000);
    let mut table = ResourceTable::new(idle);
    let registry = InvariantRegistry::standard();
    let mut now = Instant::now();
    let mut leases: BTreeMap<ResourceId, Vec<LeaseId>> = BTreeMap::new();

    for (n, op) in ops.into_iter().take(128).enumerate() {
        let ticket = Ticket(n as u64);
        match op {
            TableOp::Open { id: raw, with, prewarm, fails } => {
                let open = if prewarm {
                    OpenRequest::prewarm(id(raw))
                } else {
                    OpenRequest::shared(id(raw), with.iter().take(3).map(|w| id(*w)))
                };
                let plan = table.plan_open(&open);
                for handle in plan.close_first {
                    assert!(table.close(handle, now).is_some());
                }
                if plan.reuse.is_none() {
                    if fails {
                        table.open_failed(&open, now);
                        continue;
                    }
                    table.insert_opened(&open, now);
                }
                for connect in table.admit(ticket, &open, now) {
                    leases.entry(connect.handle.id).or_default().push(connect.lease);
                }
            },
            TableOp::CloseById(raw) => {
                table.close_by_id(id(raw), now);
            },
            TableOp::CloseAll => {
                table.close_all(now);
                assert_eq!(table.active_count(), 0);
                assert_eq!(table.pending_count(), 0);
            },
            TableOp::Release(raw) => {
                if let Some(held) = leases.get_mut(&id(raw))
                    && let Some(lease) = held.pop()
                {
                    table.release(lease, now);
                }
            },
            TableOp::Advance(ms) => now += Duration::from_millis(u64::from(ms)),
            TableOp::Expire => {
                let snapshot = table.snapshot();
                for handle in table.expired(now) {
                    assert!(snapshot.get(handle.id).is_some_and(|a| a.idle));
                    table.close(handle, now);
                }
            },
        }

        let state = SystemSnapshot::from_table(table.snapshot());
        registry.assert_all(&state, &format!("after op {n}"));
    }
});
