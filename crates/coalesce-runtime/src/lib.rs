//! Coalesce runtime
//!
//! Tokio glue around [`coalesce_core`]. Producers submit requests through a
//! cloneable [`ResourceQueue`]; a single worker task drains the bounded
//! backlog in batches, prunes each batch, and executes what survives against
//! a [`ResourceBackend`].
//!
//! # Components
//!
//! - [`ResourceQueue`]: non-blocking producer handle
//! - [`ResourceBackend`]: opens and closes the managed resources
//! - [`Lease`]: a connected requester's claim on an open resource
//! - [`QueueConfig`]: backlog size, wake lock timing, and retry policy
//!
//! # Example
//!
//! ```ignore
//! let (queue, worker) = ResourceQueue::spawn(backend, QueueConfig::default())?;
//! let ticket = queue.open(ResourceId(0))?;
//! if let OpenOutcome::Connected(lease) = ticket.outcome().await {
//!     use_camera(lease.resource());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod config;
mod error;
mod lease;
mod queue;
mod worker;

pub use backend::ResourceBackend;
pub use config::{QueueConfig, RetryPolicy};
pub use error::QueueError;
pub use lease::{Completion, Lease, OpenOutcome, OpenTicket};
pub use queue::ResourceQueue;
