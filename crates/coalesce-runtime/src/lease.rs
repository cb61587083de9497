//! Caller-side handles: leases, open tickets, and completions.

use std::{fmt, sync::Arc};

use coalesce_core::{LeaseId, ResourceError, ResourceHandle, ResourceId, Ticket};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::QueueError;

/// Claim on an open resource, held by a connected requester.
///
/// While any lease on a resource is alive its wake lock cannot expire.
/// Dropping the lease releases it. A lease is revoked when its resource is
/// closed by a close request or replaced by a conflicting open.
pub struct Lease<R> {
    id: LeaseId,
    handle: ResourceHandle,
    resource: Arc<R>,
    revoked: watch::Receiver<bool>,
    releases: mpsc::UnboundedSender<LeaseId>,
}

impl<R> Lease<R> {
    pub(crate) fn new(
        id: LeaseId,
        handle: ResourceHandle,
        resource: Arc<R>,
        revoked: watch::Receiver<bool>,
        releases: mpsc::UnboundedSender<LeaseId>,
    ) -> Self {
        Self { id, handle, resource, revoked, releases }
    }

    /// Opening this lease belongs to.
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    /// The opened resource.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Whether the resource has been closed underneath this lease.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Wait until the resource is closed underneath this lease.
    pub async fn revoked(&mut self) {
        // Sender only goes away after flagging the revocation or at shutdown.
        let _ = self.revoked.wait_for(|revoked| *revoked).await;
    }

    /// Give the lease back. Same as dropping it.
    pub fn release(self) {}
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        // Worker gone means there is nothing left to release.
        let _ = self.releases.send(self.id);
    }
}

impl<R> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// How an open request ended.
#[derive(Debug)]
pub enum OpenOutcome<R> {
    /// Every co-owned resource is active; the caller holds a lease
    Connected(Lease<R>),
    /// Superseded or closed before connecting. Not an error
    Disconnected,
    /// Open failed
    Failed(ResourceError),
}

impl<R> OpenOutcome<R> {
    /// Whether a lease was granted.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// The granted lease, if any.
    pub fn into_lease(self) -> Option<Lease<R>> {
        match self {
            Self::Connected(lease) => Some(lease),
            Self::Disconnected | Self::Failed(_) => None,
        }
    }
}

/// Pending result of an open request.
#[derive(Debug)]
pub struct OpenTicket<R> {
    ticket: Ticket,
    resource: ResourceId,
    outcome: oneshot::Receiver<OpenOutcome<R>>,
}

impl<R> OpenTicket<R> {
    pub(crate) fn new(
        ticket: Ticket,
        resource: ResourceId,
        outcome: oneshot::Receiver<OpenOutcome<R>>,
    ) -> Self {
        Self { ticket, resource, outcome }
    }

    /// Submission ticket of the request.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Resource requested.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Wait for the request to connect, be superseded, or fail.
    pub async fn outcome(self) -> OpenOutcome<R> {
        self.outcome.await.unwrap_or(OpenOutcome::Failed(ResourceError::QueueClosed))
    }

    /// The outcome, if the worker has settled the request already.
    ///
    /// Returns `None` while the request is queued or parked waiting for its
    /// group. Must not be called again after it returned `Some`.
    pub fn try_outcome(&mut self) -> Option<OpenOutcome<R>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(OpenOutcome::Failed(ResourceError::QueueClosed))
            },
        }
    }
}

/// Resolves once a request, or whatever superseded it, has been processed.
#[derive(Debug)]
pub struct Completion {
    ticket: Ticket,
    done: oneshot::Receiver<Result<(), ResourceError>>,
}

impl Completion {
    pub(crate) fn new(ticket: Ticket, done: oneshot::Receiver<Result<(), ResourceError>>) -> Self {
        Self { ticket, done }
    }

    /// Submission ticket of the request.
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Wait for the request to be processed.
    ///
    /// A prewarm whose open failed resolves with [`QueueError::Open`].
    pub async fn wait(self) -> Result<(), QueueError> {
        let result = self.done.await.map_err(|_| QueueError::Closed)?;
        result.map_err(QueueError::from)
    }

    /// The result, if the request has been processed already.
    pub fn try_wait(&mut self) -> Option<Result<(), QueueError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result.map_err(QueueError::from)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(QueueError::Closed)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_lease_sends_release() {
        let (releases, mut released) = mpsc::unbounded_channel();
        let (_revoke, revoked) = watch::channel(false);
        let handle = ResourceHandle { id: ResourceId(1), generation: 0 };

        let lease = Lease::new(LeaseId(7), handle, Arc::new(()), revoked, releases);
        assert!(!lease.is_revoked());
        lease.release();

        assert_eq!(released.recv().await, Some(LeaseId(7)));
    }

    #[tokio::test]
    async fn revocation_wakes_holder() {
        let (releases, _released) = mpsc::unbounded_channel();
        let (revoke, revoked) = watch::channel(false);
        let handle = ResourceHandle { id: ResourceId(1), generation: 0 };
        let mut lease = Lease::new(LeaseId(1), handle, Arc::new(5u8), revoked, releases);

        revoke.send_replace(true);
        lease.revoked().await;
        assert!(lease.is_revoked());
        assert_eq!(*lease.resource(), 5);
    }

    #[tokio::test]
    async fn dropped_sender_reports_closed() {
        let (tx, rx) = oneshot::channel::<OpenOutcome<()>>();
        drop(tx);
        let ticket = OpenTicket::new(Ticket(0), ResourceId(0), rx);
        assert!(matches!(ticket.outcome().await, OpenOutcome::Failed(ResourceError::QueueClosed)));

        let (tx, rx) = oneshot::channel();
        drop(tx);
        assert_eq!(Completion::new(Ticket(1), rx).wait().await, Err(QueueError::Closed));
    }

    #[test]
    fn try_outcome_reports_progress() {
        let (tx, rx) = oneshot::channel::<OpenOutcome<()>>();
        let mut ticket = OpenTicket::new(Ticket(2), ResourceId(0), rx);
        assert!(ticket.try_outcome().is_none());

        tx.send(OpenOutcome::Disconnected).unwrap();
        assert!(matches!(ticket.try_outcome(), Some(OpenOutcome::Disconnected)));

        let (tx, rx) = oneshot::channel();
        let mut completion = Completion::new(Ticket(3), rx);
        assert_eq!(completion.try_wait(), None);
        tx.send(Ok(())).unwrap();
        assert_eq!(completion.try_wait(), Some(Ok(())));

        let (tx, rx) = oneshot::channel();
        let mut completion = Completion::new(Ticket(4), rx);
        let err = ResourceError::Unavailable { resource: ResourceId(4), code: 13 };
        tx.send(Err(err)).unwrap();
        assert_eq!(completion.try_wait(), Some(Err(QueueError::Open(err))));
    }
}
