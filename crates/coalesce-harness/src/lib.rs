//! Simulation harness for Coalesce.
//!
//! Runs the real worker against an in-memory backend so request sequences can
//! be replayed deterministically on a paused Tokio clock.
//!
//! # Components
//!
//! - [`SimBackend`]: in-memory backend with latency and seeded fault injection
//! - [`invariants`]: properties checked against a [`SystemSnapshot`]. Use
//!   [`InvariantRegistry::standard()`] for the full set.
//! - [`script`]: a small request language and its runner, shared by tests and
//!   the `coalesce` binary

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod script;
pub mod sim_backend;

pub use invariants::{
    BackendMatchesTable, IdleMeansUnclaimed, Invariant, InvariantRegistry, InvariantResult,
    NoDoubleOpen, PendingGroupsIncomplete, SingleActivePerResource, SystemSnapshot, Violation,
    affected_resources,
};
pub use script::{Script, ScriptError, ScriptRunner, Step, Transcript};
pub use sim_backend::{SIM_BUSY_CODE, SimBackend, SimConfig, SimEvent, SimInspector, SimResource};
