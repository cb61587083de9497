//! Coalesce core
//!
//! Sans-IO logic for a pruning resource request queue. Nothing in this crate
//! performs I/O or reads a clock: callers pass time in and execute the plans
//! it returns. The async worker lives in `coalesce-runtime`.
//!
//! # Components
//!
//! - [`Request`]: the Open/Close request model submitted by producers
//! - [`prune`]: coalesces a batch of requests before it is executed
//! - [`ResourceTable`]: tracks active resources, pending opens, and leases
//! - [`ResourceError`]: failures surfaced to open callers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod prune;
mod request;
pub mod table;

pub use error::ResourceError;
pub use prune::{Fate, PrunePlan, Pruned, prune};
pub use request::{CoOwnedSet, OpenRequest, Queued, Request, ResourceHandle, ResourceId, Ticket};
pub use table::{
    ActiveSummary, Closing, Connect, LeaseId, OpenPlan, PendingOpen, ResourceTable, TableSnapshot,
};
