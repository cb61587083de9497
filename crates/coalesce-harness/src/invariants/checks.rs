//! Standard invariant checks.
//!
//! Each check holds at every point the worker can be observed from outside:
//! the worker publishes its table only between backend calls.

use std::collections::BTreeSet;

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// The backend never holds two openings of one resource.
///
/// Also rejects closes of openings the backend never handed out, which would
/// mean the worker lost track of a handle.
pub struct NoDoubleOpen;

impl Invariant for NoDoubleOpen {
    fn name(&self) -> &'static str {
        "no_double_open"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        if state.double_opens > 0 || state.unknown_closes > 0 {
            return Err(Violation::new(
                self.name(),
                format!(
                    "backend saw {} double opens and {} unknown closes",
                    state.double_opens, state.unknown_closes
                ),
            ));
        }
        Ok(())
    }
}

/// At most one active opening per resource id.
pub struct SingleActivePerResource;

impl Invariant for SingleActivePerResource {
    fn name(&self) -> &'static str {
        "single_active_per_resource"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let mut seen = BTreeSet::new();
        for active in &state.table.active {
            if !seen.insert(active.handle.id) {
                return Err(Violation::new(self.name(), "more than one opening")
                    .on(active.handle.id));
            }
        }
        Ok(())
    }
}

/// The table's active set is exactly what the backend holds open.
pub struct BackendMatchesTable;

impl Invariant for BackendMatchesTable {
    fn name(&self) -> &'static str {
        "backend_matches_table"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let table: BTreeSet<_> = state.table.active_ids().into_iter().collect();
        if let Some(id) = table.symmetric_difference(&state.backend_open).next() {
            let message = if table.contains(id) {
                "active in the table but not open in the backend"
            } else {
                "open in the backend but not active in the table"
            };
            return Err(Violation::new(self.name(), message).on(*id));
        }
        Ok(())
    }
}

/// A parked open always waits on something.
///
/// Some participant of its group is either not active or active in a
/// different group; otherwise it should have been connected.
pub struct PendingGroupsIncomplete;

impl Invariant for PendingGroupsIncomplete {
    fn name(&self) -> &'static str {
        "pending_groups_incomplete"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for parked in &state.table.pending {
            let ready = parked.open.participants().iter().all(|id| {
                state.table.get(*id).is_some_and(|active| active.shared == parked.open.shared)
            });
            if ready {
                return Err(Violation::new(
                    self.name(),
                    format!("ticket {} is parked but its group is active", parked.ticket),
                )
                .on(parked.open.resource));
            }
        }
        Ok(())
    }
}

/// A resource's wake lock runs exactly when nothing refers to it.
///
/// Idle means no leases and no parked open for that resource.
pub struct IdleMeansUnclaimed;

impl Invariant for IdleMeansUnclaimed {
    fn name(&self) -> &'static str {
        "idle_means_unclaimed"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for active in &state.table.active {
            let id = active.handle.id;
            let parked = state.table.pending.iter().any(|p| p.open.resource == id);
            let unclaimed = active.leases == 0 && !parked;
            if active.idle != unclaimed {
                return Err(Violation::new(
                    self.name(),
                    format!("idle={} but leases={} parked={parked}", active.idle, active.leases),
                )
                .on(id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use coalesce_core::{
        ActiveSummary, CoOwnedSet, OpenRequest, PendingOpen, ResourceHandle, ResourceId,
        TableSnapshot, Ticket,
    };

    use super::*;

    fn active(n: u32, shared: CoOwnedSet, leases: usize, idle: bool) -> ActiveSummary {
        ActiveSummary {
            handle: ResourceHandle { id: ResourceId(n), generation: u64::from(n) },
            shared,
            leases,
            idle,
        }
    }

    #[test]
    fn double_open_detected() {
        let state = SystemSnapshot { double_opens: 1, ..Default::default() };
        assert!(NoDoubleOpen.check(&state).is_err());
        assert!(NoDoubleOpen.check(&SystemSnapshot::empty()).is_ok());
    }

    #[test]
    fn backend_mismatch_detected() {
        let table = TableSnapshot {
            active: vec![active(0, CoOwnedSet::single(), 1, false)],
            pending: Vec::new(),
        };
        let mut state = SystemSnapshot::from_table(table);
        assert!(BackendMatchesTable.check(&state).is_ok());

        state.backend_open.insert(ResourceId(4));
        let violation = BackendMatchesTable.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "backend_matches_table");
        assert_eq!(violation.resource, Some(ResourceId(4)));
    }

    #[test]
    fn ready_pending_group_detected() {
        let open = OpenRequest::shared(ResourceId(0), [ResourceId(1)]);
        let shared = open.shared.clone();
        let mut table = TableSnapshot {
            active: vec![active(0, shared.clone(), 0, false)],
            pending: vec![PendingOpen { ticket: Ticket(3), open }],
        };
        assert!(PendingGroupsIncomplete.check(&SystemSnapshot::from_table(table.clone())).is_ok());

        table.active.push(active(1, shared, 0, true));
        assert!(PendingGroupsIncomplete.check(&SystemSnapshot::from_table(table)).is_err());
    }

    #[test]
    fn idle_with_lease_detected() {
        let table = TableSnapshot {
            active: vec![active(2, CoOwnedSet::single(), 1, true)],
            pending: Vec::new(),
        };
        assert!(IdleMeansUnclaimed.check(&SystemSnapshot::from_table(table)).is_err());
    }
}
