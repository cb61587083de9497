//! Resource table.
//!
//! Bookkeeping for active resources, parked opens, and the leases connected
//! requesters hold. The table never talks to a backend: the worker asks it
//! what to close and open, performs the I/O, and reports back.
//!
//! # Wake locks
//!
//! A resource with no leases and no parked open referring to it is idle. The
//! table records when it became idle; once [`ResourceTable::expired`] reports
//! it, the worker enqueues a `Close(handle)` for it. Attaching a lease or
//! parking an open clears the idle mark, which cancels the pending expiry.
//!
//! Generic over `I` (Instant type) to support virtual time in tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Sub,
    time::{Duration, Instant},
};

use crate::request::{CoOwnedSet, OpenRequest, ResourceHandle, ResourceId, Ticket};

/// Token held by a connected requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub u64);

/// An open parked until every co-owned resource is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOpen {
    /// Ticket of the parked request
    pub ticket: Ticket,
    /// The parked request
    pub open: OpenRequest,
}

/// What the worker must do before an open can be admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenPlan {
    /// Active openings that conflict with the request, to close first
    pub close_first: Vec<ResourceHandle>,
    /// Existing opening that already satisfies the request
    pub reuse: Option<ResourceHandle>,
}

/// A parked open that became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    /// Ticket of the request being connected
    pub ticket: Ticket,
    /// Lease attached for the requester
    pub lease: LeaseId,
    /// Opening the lease belongs to
    pub handle: ResourceHandle,
}

/// Side effects of removing a resource from the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Closing {
    /// Opening to close through the backend, if one was active
    pub handle: Option<ResourceHandle>,
    /// Leases that no longer refer to anything
    pub revoked: Vec<LeaseId>,
    /// Parked opens that can no longer be satisfied
    pub disconnected: Vec<Ticket>,
}

/// Published view of one active resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSummary {
    /// Current opening
    pub handle: ResourceHandle,
    /// Group the resource was opened in
    pub shared: CoOwnedSet,
    /// Number of leases held
    pub leases: usize,
    /// Whether the wake lock is counting down
    pub idle: bool,
}

/// Published view of the whole table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Active resources, ordered by id
    pub active: Vec<ActiveSummary>,
    /// Parked opens, oldest first
    pub pending: Vec<PendingOpen>,
}

impl TableSnapshot {
    /// Ids of the active resources.
    pub fn active_ids(&self) -> Vec<ResourceId> {
        self.active.iter().map(|a| a.handle.id).collect()
    }

    /// Summary for `id`, if it is active.
    pub fn get(&self, id: ResourceId) -> Option<&ActiveSummary> {
        self.active.iter().find(|a| a.handle.id == id)
    }

    /// No active resources and nothing parked.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ActiveResource<I> {
    handle: ResourceHandle,
    shared: CoOwnedSet,
    leases: BTreeSet<LeaseId>,
    idle_since: Option<I>,
}

/// Active resources, parked opens, and leases.
#[derive(Debug)]
pub struct ResourceTable<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    active: BTreeMap<ResourceId, ActiveResource<I>>,
    pending: Vec<PendingOpen>,
    idle_timeout: Duration,
    next_generation: u64,
    next_lease: u64,
}

impl<I> ResourceTable<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create an empty table whose idle resources expire after `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            active: BTreeMap::new(),
            pending: Vec::new(),
            idle_timeout,
            next_generation: 0,
            next_lease: 0,
        }
    }

    /// Current opening of `id`, if active.
    pub fn handle(&self, id: ResourceId) -> Option<ResourceHandle> {
        self.active.get(&id).map(|a| a.handle)
    }

    /// Number of active resources.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of parked opens.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decide what must happen before `open` can be admitted.
    ///
    /// An active resource with the same id and co-owned set is reused. Any
    /// other opening of the same id conflicts, and so does every opening
    /// whose co-owned set differs when either side is a concurrent group.
    ///
    /// A prewarm plans like a single open: prewarming any id tears down an
    /// active concurrent group, leases and all.
    pub fn plan_open(&self, open: &OpenRequest) -> OpenPlan {
        let mut plan = OpenPlan::default();
        for (id, active) in &self.active {
            if *id == open.resource && active.shared == open.shared {
                plan.reuse = Some(active.handle);
            } else if *id == open.resource
                || (active.shared != open.shared
                    && (active.shared.is_shared() || open.shared.is_shared()))
            {
                plan.close_first.push(active.handle);
            }
        }
        plan
    }

    /// Record a resource the backend just opened.
    ///
    /// It starts out idle; [`Self::admit`] claims it.
    pub fn insert_opened(&mut self, open: &OpenRequest, now: I) -> ResourceHandle {
        let handle = ResourceHandle { id: open.resource, generation: self.next_generation };
        self.next_generation += 1;

        let entry = ActiveResource {
            handle,
            shared: open.shared.clone(),
            leases: BTreeSet::new(),
            idle_since: Some(now),
        };
        if let Some(previous) = self.active.insert(open.resource, entry) {
            tracing::error!(
                previous = %previous.handle,
                %handle,
                "replaced an active resource that was never closed"
            );
        }
        handle
    }

    /// Register the requester of an open whose resource is now active.
    ///
    /// The request is parked, then every parked open whose group is fully
    /// active is connected, this one included if it is ready. Prewarm opens
    /// have no requester and only restart the idle clock.
    pub fn admit(&mut self, ticket: Ticket, open: &OpenRequest, now: I) -> Vec<Connect> {
        if open.prewarm {
            if let Some(active) = self.active.get_mut(&open.resource)
                && active.idle_since.is_some()
            {
                active.idle_since = Some(now);
            }
            return Vec::new();
        }

        if let Some(active) = self.active.get_mut(&open.resource) {
            active.idle_since = None;
        }
        self.pending.push(PendingOpen { ticket, open: open.clone() });
        self.connect_ready()
    }

    /// Drop parked opens of the group `open` belonged to after it failed.
    ///
    /// Returns their tickets; the callers get the same error.
    pub fn open_failed(&mut self, open: &OpenRequest, now: I) -> Vec<Ticket> {
        if !open.shared.is_shared() {
            return Vec::new();
        }

        let (failed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| p.open.shared == open.shared);
        self.pending = kept;

        for parked in &failed {
            self.settle_idle(parked.open.resource, now);
        }
        failed.into_iter().map(|p| p.ticket).collect()
    }

    /// Remove one specific opening.
    ///
    /// Returns `None` if `handle` is not the current opening of its resource.
    pub fn close(&mut self, handle: ResourceHandle, now: I) -> Option<Closing> {
        if self.handle(handle.id) != Some(handle) {
            return None;
        }
        Some(self.evict(handle.id, now))
    }

    /// Remove whatever opening of `id` is active.
    ///
    /// Parked opens involving `id` are disconnected even if `id` itself was
    /// never opened.
    pub fn close_by_id(&mut self, id: ResourceId, now: I) -> Closing {
        self.evict(id, now)
    }

    /// Remove every active resource and disconnect every parked open.
    pub fn close_all(&mut self, now: I) -> Vec<Closing> {
        let ids: Vec<ResourceId> = self.active.keys().copied().collect();
        let mut closings: Vec<Closing> = ids.into_iter().map(|id| self.evict(id, now)).collect();

        let leftover: Vec<Ticket> =
            std::mem::take(&mut self.pending).into_iter().map(|p| p.ticket).collect();
        if !leftover.is_empty() {
            closings.push(Closing { handle: None, revoked: Vec::new(), disconnected: leftover });
        }
        closings
    }

    /// Release a lease.
    ///
    /// Returns `false` if the lease was already revoked or released.
    pub fn release(&mut self, lease: LeaseId, now: I) -> bool {
        let Some(id) = self
            .active
            .iter_mut()
            .find_map(|(id, active)| active.leases.remove(&lease).then_some(*id))
        else {
            return false;
        };

        self.settle_idle(id, now);
        true
    }

    /// Idle resources whose wake lock has run out.
    pub fn expired(&self, now: I) -> Vec<ResourceHandle> {
        self.active
            .values()
            .filter(|a| a.idle_since.is_some_and(|since| now - since >= self.idle_timeout))
            .map(|a| a.handle)
            .collect()
    }

    /// Point-in-time view for publishing.
    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            active: self
                .active
                .values()
                .map(|a| ActiveSummary {
                    handle: a.handle,
                    shared: a.shared.clone(),
                    leases: a.leases.len(),
                    idle: a.idle_since.is_some(),
                })
                .collect(),
            pending: self.pending.clone(),
        }
    }

    fn evict(&mut self, id: ResourceId, now: I) -> Closing {
        let removed = self.active.remove(&id);

        let (dropped, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| p.open.involves(id));
        self.pending = kept;
        for parked in &dropped {
            self.settle_idle(parked.open.resource, now);
        }

        Closing {
            handle: removed.as_ref().map(|a| a.handle),
            revoked: removed.map(|a| a.leases.into_iter().collect()).unwrap_or_default(),
            disconnected: dropped.into_iter().map(|p| p.ticket).collect(),
        }
    }

    fn connect_ready(&mut self) -> Vec<Connect> {
        let mut connects = Vec::new();
        for parked in std::mem::take(&mut self.pending) {
            if !self.group_ready(&parked.open) {
                self.pending.push(parked);
                continue;
            }

            let lease = LeaseId(self.next_lease);
            self.next_lease += 1;
            if let Some(active) = self.active.get_mut(&parked.open.resource) {
                active.leases.insert(lease);
                active.idle_since = None;
                connects.push(Connect { ticket: parked.ticket, lease, handle: active.handle });
            }
        }
        connects
    }

    fn group_ready(&self, open: &OpenRequest) -> bool {
        open.participants()
            .iter()
            .all(|id| self.active.get(id).is_some_and(|a| a.shared == open.shared))
    }

    /// Start the idle clock on `id` if nothing refers to it any more.
    fn settle_idle(&mut self, id: ResourceId, now: I) {
        let parked = self.pending.iter().any(|p| p.open.resource == id);
        if let Some(active) = self.active.get_mut(&id)
            && active.leases.is_empty()
            && !parked
            && active.idle_since.is_none()
        {
            active.idle_since = Some(now);
        }
    }
}
