//! Observable state snapshots for invariant checking.
//!
//! A snapshot pairs the table state the worker last published with what the
//! backend actually holds. Invariants operate on snapshots rather than live
//! state so each check sees one consistent view.

use std::{collections::BTreeSet, fmt};

use coalesce_core::{ResourceId, TableSnapshot};

use crate::sim_backend::SimInspector;

/// Snapshot of the queue and backend together.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Table state published by the worker
    pub table: TableSnapshot,
    /// Resources the backend holds open
    pub backend_open: BTreeSet<ResourceId>,
    /// Opens of an already-open id seen by the backend
    pub double_opens: usize,
    /// Closes of an opening the backend did not consider current
    pub unknown_closes: usize,
}

impl SystemSnapshot {
    /// Create an empty snapshot (nothing open anywhere).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pair a published table state with the backend's current state.
    pub fn capture(table: TableSnapshot, backend: &SimInspector) -> Self {
        Self {
            table,
            backend_open: backend.open_ids(),
            double_opens: backend.double_opens(),
            unknown_closes: backend.unknown_closes(),
        }
    }

    /// Snapshot of a table alone, assuming the backend agrees with it.
    pub fn from_table(table: TableSnapshot) -> Self {
        let backend_open = table.active_ids().into_iter().collect();
        Self { table, backend_open, ..Default::default() }
    }
}

/// One line per active resource and parked open, then the backend's view.
impl fmt::Display for SystemSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for active in &self.table.active {
            write!(f, "active {} leases={}", active.handle, active.leases)?;
            if active.idle {
                write!(f, " idle")?;
            }
            if active.shared.is_shared() {
                let group: Vec<_> = active.shared.iter().map(|id| id.to_string()).collect();
                write!(f, " group={}", group.join(","))?;
            }
            writeln!(f)?;
        }
        for parked in &self.table.pending {
            writeln!(f, "parked {} on {}", parked.ticket, parked.open.resource)?;
        }
        let open: Vec<_> = self.backend_open.iter().map(ToString::to_string).collect();
        write!(f, "backend open [{}]", open.join(","))?;
        if self.double_opens > 0 || self.unknown_closes > 0 {
            write!(
                f,
                " double_opens={} unknown_closes={}",
                self.double_opens, self.unknown_closes
            )?;
        }
        Ok(())
    }
}
