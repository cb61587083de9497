//! Producer handle for the request queue.
//!
//! [`ResourceQueue`] is cheap to clone and safe to use from any task or
//! thread. Every submission is non-blocking: a full backlog is reported to
//! the caller immediately instead of waiting or dropping the request.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use coalesce_core::{
    OpenRequest, Request, ResourceError, ResourceHandle, ResourceId, TableSnapshot, Ticket,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    backend::ResourceBackend,
    config::QueueConfig,
    error::QueueError,
    lease::{Completion, OpenOutcome, OpenTicket},
    worker::Worker,
};

/// How the worker answers a request.
pub(crate) enum Reply<R> {
    /// Open caller waiting for a lease
    Open(oneshot::Sender<OpenOutcome<R>>),
    /// Caller waiting for the request to be processed
    Done(oneshot::Sender<Result<(), ResourceError>>),
    /// Internally generated, nobody waiting
    None,
}

/// A request in flight to the worker.
pub(crate) struct Envelope<R> {
    pub(crate) ticket: Ticket,
    pub(crate) request: Request,
    pub(crate) reply: Reply<R>,
}

/// Allocates tickets shared by producers and the worker.
#[derive(Debug, Clone, Default)]
pub(crate) struct TicketCounter(Arc<AtomicU64>);

impl TicketCounter {
    pub(crate) fn next(&self) -> Ticket {
        Ticket(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Multi-producer handle to a pruning request queue.
///
/// Dropping every handle shuts the worker down: it closes all resources and
/// resolves every outstanding caller before exiting.
pub struct ResourceQueue<R> {
    requests: mpsc::Sender<Envelope<R>>,
    tickets: TicketCounter,
    snapshot: watch::Receiver<TableSnapshot>,
    capacity: usize,
}

impl<R> Clone for ResourceQueue<R> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            tickets: self.tickets.clone(),
            snapshot: self.snapshot.clone(),
            capacity: self.capacity,
        }
    }
}

impl<R> ResourceQueue<R>
where
    R: Send + Sync + 'static,
{
    /// Spawn a worker on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Config`] if `config` is invalid.
    pub fn spawn<B>(backend: B, config: QueueConfig) -> Result<(Self, JoinHandle<()>), QueueError>
    where
        B: ResourceBackend<Resource = R>,
    {
        config.validate()?;

        let (requests, inbox) = mpsc::channel(config.capacity);
        let (publish, snapshot) = watch::channel(TableSnapshot::default());
        let tickets = TicketCounter::default();
        let capacity = config.capacity;

        let worker = Worker::new(backend, config, inbox, publish, tickets.clone());
        let join = tokio::spawn(worker.run());

        Ok((Self { requests, tickets, snapshot, capacity }, join))
    }

    /// Open `resource` on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::QueueOverflow`] if the backlog is full and
    /// [`ResourceError::QueueClosed`] if the worker is gone.
    pub fn open(&self, resource: ResourceId) -> Result<OpenTicket<R>, ResourceError> {
        self.submit_open(OpenRequest::new(resource))
    }

    /// Open `resource` as part of a concurrent group with `shared`.
    ///
    /// The ticket connects only once every member of the group is active.
    pub fn open_shared(
        &self,
        resource: ResourceId,
        shared: impl IntoIterator<Item = ResourceId>,
    ) -> Result<OpenTicket<R>, ResourceError> {
        self.submit_open(OpenRequest::shared(resource, shared))
    }

    /// Open `resource` ahead of use. It closes itself after the idle timeout
    /// unless an open claims it first.
    ///
    /// The completion fails with [`QueueError::Open`] if the backend refuses
    /// the open.
    pub fn prewarm(&self, resource: ResourceId) -> Result<Completion, QueueError> {
        self.submit_waiting(Request::Open(OpenRequest::prewarm(resource)))
    }

    /// Close whatever opening of `resource` is active.
    pub fn close(&self, resource: ResourceId) -> Result<Completion, QueueError> {
        self.submit_waiting(Request::CloseById(resource))
    }

    /// Close one specific opening. No effect if it was already replaced.
    pub fn close_handle(&self, handle: ResourceHandle) -> Result<Completion, QueueError> {
        self.submit_waiting(Request::Close(handle))
    }

    /// Close everything, superseding every request queued before this one.
    pub fn close_all(&self) -> Result<Completion, QueueError> {
        self.submit_waiting(Request::CloseAll)
    }

    /// Table state as of the last processed request.
    pub fn snapshot(&self) -> TableSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified every time the worker publishes the table.
    ///
    /// The worker publishes after each request it executes, after any caller
    /// it resolved along the way.
    pub fn subscribe(&self) -> watch::Receiver<TableSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the worker publishes a table state matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Closed`] if the worker exits first.
    pub async fn wait_for_snapshot(
        &self,
        predicate: impl FnMut(&TableSnapshot) -> bool,
    ) -> Result<TableSnapshot, QueueError> {
        let mut snapshot = self.snapshot.clone();
        let state = snapshot.wait_for(predicate).await.map_err(|_| QueueError::Closed)?;
        Ok(state.clone())
    }

    fn submit_open(&self, open: OpenRequest) -> Result<OpenTicket<R>, ResourceError> {
        let resource = open.resource;
        let (reply, outcome) = oneshot::channel();
        let ticket = self.submit(Request::Open(open), Reply::Open(reply)).map_err(|err| match err {
            QueueError::Overflow { .. } => ResourceError::QueueOverflow { resource },
            QueueError::Open(err) => err,
            QueueError::Closed | QueueError::Config(_) => ResourceError::QueueClosed,
        })?;
        Ok(OpenTicket::new(ticket, resource, outcome))
    }

    fn submit_waiting(&self, request: Request) -> Result<Completion, QueueError> {
        let (reply, done) = oneshot::channel();
        let ticket = self.submit(request, Reply::Done(reply))?;
        Ok(Completion::new(ticket, done))
    }

    fn submit(&self, request: Request, reply: Reply<R>) -> Result<Ticket, QueueError> {
        let ticket = self.tickets.next();
        let kind = request.kind();
        match self.requests.try_send(Envelope { ticket, request, reply }) {
            Ok(()) => {
                tracing::trace!(%ticket, kind, "request queued");
                Ok(ticket)
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%ticket, kind, capacity = self.capacity, "request queue full");
                Err(QueueError::Overflow { capacity: self.capacity })
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }
}
