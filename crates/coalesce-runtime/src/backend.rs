//! Backend trait for opening and closing the managed resources.
//!
//! The [`ResourceBackend`] trait decouples the worker from whatever actually
//! owns the resources. The worker guarantees it never opens an id that is
//! already open and always awaits a close before the replacement open.
//!
//! # Implementations
//!
//! - **Simulation**: `coalesce_harness::SimBackend`, in-memory with latency
//!   and fault injection
//! - **Devices**: a platform binding that opens real hardware handles

use std::{future::Future, sync::Arc};

use coalesce_core::{ResourceError, ResourceHandle, ResourceId};

/// Opens and closes exclusively-owned resources.
pub trait ResourceBackend: Send + 'static {
    /// Object produced by a successful open, shared with lease holders.
    type Resource: Send + Sync + 'static;

    /// Open `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Busy`] for contention that may clear on
    /// retry, and [`ResourceError::Unavailable`] otherwise.
    fn open(
        &mut self,
        id: ResourceId,
    ) -> impl Future<Output = Result<Self::Resource, ResourceError>> + Send;

    /// Close an opening. Lease holders may still hold clones of `resource`.
    fn close(
        &mut self,
        handle: ResourceHandle,
        resource: Arc<Self::Resource>,
    ) -> impl Future<Output = ()> + Send;
}
