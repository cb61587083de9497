//! Single-consumer worker loop.
//!
//! The worker owns the [`ResourceTable`] and the backend. Each cycle it takes
//! everything waiting in the inbox as one batch, prunes it, settles the
//! callers of pruned requests, then executes the survivors one at a time.
//! Closes are awaited before the open that replaces them, so the backend
//! never sees two openings of the same id.
//!
//! Lease releases arrive on a separate unbounded channel because they come
//! from `Drop` and must never be refused.

use std::{collections::HashMap, sync::Arc};

use coalesce_core::{
    Closing, Connect, Fate, LeaseId, OpenRequest, Pruned, Queued, Request, ResourceError,
    ResourceHandle, ResourceId, ResourceTable, TableSnapshot, Ticket, prune,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};

use crate::{
    backend::ResourceBackend,
    config::QueueConfig,
    lease::{Lease, OpenOutcome},
    queue::{Envelope, Reply, TicketCounter},
};

pub(crate) struct Worker<B>
where
    B: ResourceBackend,
{
    backend: B,
    config: QueueConfig,
    table: ResourceTable<Instant>,
    inbox: mpsc::Receiver<Envelope<B::Resource>>,
    releases: mpsc::UnboundedReceiver<LeaseId>,
    release_tx: mpsc::UnboundedSender<LeaseId>,
    snapshots: watch::Sender<TableSnapshot>,
    tickets: TicketCounter,
    /// Opened resources by handle
    resources: HashMap<ResourceHandle, Arc<B::Resource>>,
    /// Open callers not yet connected, failed, or disconnected
    openers: HashMap<Ticket, oneshot::Sender<OpenOutcome<B::Resource>>>,
    /// Completion senders, including those chained from pruned requests
    waiters: HashMap<Ticket, Vec<oneshot::Sender<Result<(), ResourceError>>>>,
    /// Revocation flags of live leases
    leases: HashMap<LeaseId, watch::Sender<bool>>,
}

impl<B> Worker<B>
where
    B: ResourceBackend,
{
    pub(crate) fn new(
        backend: B,
        config: QueueConfig,
        inbox: mpsc::Receiver<Envelope<B::Resource>>,
        snapshots: watch::Sender<TableSnapshot>,
        tickets: TicketCounter,
    ) -> Self {
        let (release_tx, releases) = mpsc::unbounded_channel();
        Self {
            backend,
            table: ResourceTable::new(config.idle_timeout),
            config,
            inbox,
            releases,
            release_tx,
            snapshots,
            tickets,
            resources: HashMap::new(),
            openers: HashMap::new(),
            waiters: HashMap::new(),
            leases: HashMap::new(),
        }
    }

    /// Run until every producer handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(capacity = self.config.capacity, "worker started");

        loop {
            tokio::select! {
                biased;

                Some(lease) = self.releases.recv() => self.release(lease),

                envelope = self.inbox.recv() => match envelope {
                    Some(first) => {
                        let batch = self.drain(vec![first]);
                        self.process(batch).await;
                    },
                    None => break,
                },

                _ = tick.tick() => self.expire().await,
            }
        }

        self.shutdown().await;
    }

    /// Append everything already queued to `batch`.
    fn drain(&mut self, mut batch: Vec<Envelope<B::Resource>>) -> Vec<Envelope<B::Resource>> {
        while let Ok(lease) = self.releases.try_recv() {
            self.release(lease);
        }
        while let Ok(envelope) = self.inbox.try_recv() {
            batch.push(envelope);
        }
        batch
    }

    async fn process(&mut self, batch: Vec<Envelope<B::Resource>>) {
        let queued: Vec<Queued> = batch
            .into_iter()
            .map(|envelope| {
                self.register(envelope.ticket, envelope.reply);
                Queued::new(envelope.ticket, envelope.request)
            })
            .collect();

        let batch_len = queued.len();
        let plan = prune(queued);
        tracing::debug!(
            batch = batch_len,
            survivors = plan.survivors.len(),
            pruned = plan.pruned.len(),
            "processing batch"
        );

        for pruned in plan.pruned {
            self.settle_pruned(pruned);
        }
        for queued in plan.survivors {
            self.execute(queued).await;
        }
    }

    fn register(&mut self, ticket: Ticket, reply: Reply<B::Resource>) {
        match reply {
            Reply::Open(reply) => {
                self.openers.insert(ticket, reply);
            },
            Reply::Done(done) => self.waiters.entry(ticket).or_default().push(done),
            Reply::None => {},
        }
    }

    fn settle_pruned(&mut self, pruned: Pruned) {
        if pruned.fate == Fate::Disconnect {
            self.disconnect(pruned.ticket);
        }
        if let Some(waiting) = self.waiters.remove(&pruned.ticket) {
            self.waiters.entry(pruned.superseded_by).or_default().extend(waiting);
        }
    }

    async fn execute(&mut self, queued: Queued) {
        let Queued { ticket, request } = queued;
        tracing::debug!(%ticket, kind = request.kind(), "executing request");

        match request {
            Request::Open(open) => self.execute_open(ticket, open).await,
            Request::CloseById(id) => {
                let closing = self.table.close_by_id(id, Instant::now());
                self.finish_close(closing).await;
            },
            Request::Close(handle) => match self.table.close(handle, Instant::now()) {
                Some(closing) => self.finish_close(closing).await,
                None => tracing::debug!(%handle, "close of replaced opening ignored"),
            },
            Request::CloseAll => {
                for closing in self.table.close_all(Instant::now()) {
                    self.finish_close(closing).await;
                }
            },
        }

        self.complete(ticket);
        self.publish();
    }

    async fn execute_open(&mut self, ticket: Ticket, open: OpenRequest) {
        let plan = self.table.plan_open(&open);

        for handle in plan.close_first {
            if let Some(closing) = self.table.close(handle, Instant::now()) {
                tracing::debug!(%handle, resource = %open.resource, "closing conflicting opening");
                self.finish_close(closing).await;
            }
        }

        if plan.reuse.is_none() {
            match self.open_with_retry(open.resource).await {
                Ok(resource) => {
                    let handle = self.table.insert_opened(&open, Instant::now());
                    tracing::info!(%handle, prewarm = open.prewarm, "resource opened");
                    self.resources.insert(handle, Arc::new(resource));
                },
                Err(err) => {
                    tracing::warn!(%ticket, resource = %open.resource, error = %err, "open failed");
                    self.fail(ticket, err);
                    for parked in self.table.open_failed(&open, Instant::now()) {
                        self.fail(parked, err);
                    }
                    return;
                },
            }
        }

        for connect in self.table.admit(ticket, &open, Instant::now()) {
            self.connect(connect);
        }
    }

    async fn open_with_retry(&mut self, id: ResourceId) -> Result<B::Resource, ResourceError> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            match self.backend.open(id).await {
                Ok(resource) => return Ok(resource),
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    tracing::warn!(resource = %id, attempt, ?delay, error = %err, "retrying open");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }

    async fn finish_close(&mut self, closing: Closing) {
        for lease in closing.revoked {
            if let Some(revoke) = self.leases.remove(&lease) {
                revoke.send_replace(true);
            }
        }
        for ticket in closing.disconnected {
            self.disconnect(ticket);
        }

        let Some(handle) = closing.handle else { return };
        match self.resources.remove(&handle) {
            Some(resource) => {
                self.backend.close(handle, resource).await;
                tracing::info!(%handle, "resource closed");
            },
            None => tracing::error!(%handle, "closed a handle with no opened resource"),
        }
        self.publish();
    }

    fn connect(&mut self, connect: Connect) {
        let Some(resource) = self.resources.get(&connect.handle).cloned() else {
            tracing::error!(handle = %connect.handle, "connected a handle with no opened resource");
            self.table.release(connect.lease, Instant::now());
            return;
        };

        let (revoke, revoked) = watch::channel(false);
        self.leases.insert(connect.lease, revoke);
        let lease =
            Lease::new(connect.lease, connect.handle, resource, revoked, self.release_tx.clone());

        tracing::debug!(ticket = %connect.ticket, handle = %connect.handle, "requester connected");
        if let Some(reply) = self.openers.remove(&connect.ticket)
            && reply.send(OpenOutcome::Connected(lease)).is_err()
        {
            // Dropping the unsent lease queues its release.
            tracing::debug!(ticket = %connect.ticket, "open caller went away");
        }
    }

    fn release(&mut self, lease: LeaseId) {
        self.leases.remove(&lease);
        if self.table.release(lease, Instant::now()) {
            tracing::debug!(?lease, "lease released");
            self.publish();
        }
    }

    /// Turn expired wake locks into handle closes and run them with
    /// whatever else is queued.
    async fn expire(&mut self) {
        let expired = self.table.expired(Instant::now());
        if expired.is_empty() {
            return;
        }

        let batch: Vec<Envelope<B::Resource>> = expired
            .into_iter()
            .map(|handle| {
                tracing::debug!(%handle, "wake lock expired");
                Envelope {
                    ticket: self.tickets.next(),
                    request: Request::Close(handle),
                    reply: Reply::None,
                }
            })
            .collect();
        let batch = self.drain(batch);
        self.process(batch).await;
    }

    /// Report a failed open to its caller and to every completion chained
    /// onto it. A prewarm has no open caller, only completions.
    fn fail(&mut self, ticket: Ticket, err: ResourceError) {
        if let Some(reply) = self.openers.remove(&ticket) {
            let _ = reply.send(OpenOutcome::Failed(err));
        }
        for done in self.waiters.remove(&ticket).unwrap_or_default() {
            let _ = done.send(Err(err));
        }
    }

    fn disconnect(&mut self, ticket: Ticket) {
        if let Some(reply) = self.openers.remove(&ticket) {
            tracing::debug!(%ticket, "open caller disconnected");
            let _ = reply.send(OpenOutcome::Disconnected);
        }
    }

    fn complete(&mut self, ticket: Ticket) {
        for done in self.waiters.remove(&ticket).unwrap_or_default() {
            let _ = done.send(Ok(()));
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.table.snapshot());
    }

    async fn shutdown(&mut self) {
        tracing::debug!("all producers gone, shutting down");

        for closing in self.table.close_all(Instant::now()) {
            self.finish_close(closing).await;
        }
        for (_, reply) in self.openers.drain() {
            let _ = reply.send(OpenOutcome::Disconnected);
        }
        for done in self.waiters.drain().flat_map(|(_, waiting)| waiting) {
            let _ = done.send(Ok(()));
        }
        self.publish();
    }
}
