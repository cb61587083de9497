//! Request model.
//!
//! Producers submit [`Request`]s tagged with a [`Ticket`]. Tickets are
//! assigned in submission order and are how pruned requests name the request
//! that superseded them.

use std::{collections::BTreeSet, fmt};

/// Key of a contended, exclusively-owned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ResourceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// One specific opening of a resource.
///
/// The generation changes every time the resource is reopened, so a handle
/// captured before a close can never address the replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle {
    /// Resource this handle refers to
    pub id: ResourceId,
    /// Opening counter, unique per table
    pub generation: u64,
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.generation)
    }
}

/// Submission-order identifier of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Resources that must be active together to satisfy one open.
///
/// Empty for an ordinary single-resource open. A non-empty set always
/// contains the id of the open it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CoOwnedSet(BTreeSet<ResourceId>);

impl CoOwnedSet {
    /// Set for a non-shared open.
    pub fn single() -> Self {
        Self::default()
    }

    /// Normalized set for `owner` sharing with `ids`.
    ///
    /// Yields an empty set when `ids` is empty or names only `owner`.
    pub fn new(owner: ResourceId, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        let mut set: BTreeSet<ResourceId> = ids.into_iter().collect();
        set.insert(owner);
        if set.len() == 1 { Self::default() } else { Self(set) }
    }

    /// Whether this belongs to a concurrent group.
    pub fn is_shared(&self) -> bool {
        !self.0.is_empty()
    }

    /// Ids in the set, ascending.
    pub fn iter(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.0.iter().copied()
    }

    /// Whether `id` is part of the set.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.0.contains(&id)
    }
}

/// Request to open (or prewarm) a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Resource to open
    pub resource: ResourceId,
    /// Concurrent group the resource is opened in
    pub shared: CoOwnedSet,
    /// Open without a requester; the resource idles until claimed
    pub prewarm: bool,
}

impl OpenRequest {
    /// Ordinary single-resource open.
    pub fn new(resource: ResourceId) -> Self {
        Self { resource, shared: CoOwnedSet::single(), prewarm: false }
    }

    /// Open as part of a concurrent group.
    pub fn shared(resource: ResourceId, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        Self { resource, shared: CoOwnedSet::new(resource, ids), prewarm: false }
    }

    /// Open ahead of use, with nobody to connect.
    pub fn prewarm(resource: ResourceId) -> Self {
        Self { resource, shared: CoOwnedSet::single(), prewarm: true }
    }

    /// Every id this open needs active before its requester is connected.
    pub fn participants(&self) -> Vec<ResourceId> {
        if self.shared.is_shared() { self.shared.iter().collect() } else { vec![self.resource] }
    }

    /// Whether `id` is one of [`Self::participants`].
    pub fn involves(&self, id: ResourceId) -> bool {
        self.resource == id || self.shared.contains(id)
    }
}

/// Work submitted to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a resource and connect the requester once its group is active
    Open(OpenRequest),
    /// Close whatever opening of this resource is active
    CloseById(ResourceId),
    /// Close every active resource and disconnect every pending open
    CloseAll,
    /// Close one specific opening; ignored if it is already gone
    Close(ResourceHandle),
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open(open) if open.prewarm => "prewarm",
            Self::Open(_) => "open",
            Self::CloseById(_) => "close_by_id",
            Self::CloseAll => "close_all",
            Self::Close(_) => "close",
        }
    }
}

/// A request with its submission ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queued {
    /// Submission ticket
    pub ticket: Ticket,
    /// The request itself
    pub request: Request,
}

impl Queued {
    /// Pair a request with its ticket.
    pub fn new(ticket: Ticket, request: Request) -> Self {
        Self { ticket, request }
    }
}
