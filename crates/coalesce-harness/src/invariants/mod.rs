//! Invariant checking for simulation tests.
//!
//! Invariants are properties of the queue and backend that must hold no
//! matter which requests arrive in which order. Tests capture a
//! [`SystemSnapshot`] at any point and run the registry against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! let snapshot = SystemSnapshot::capture(queue.snapshot(), &inspector);
//! registry.check_all(&snapshot)?;
//! ```

mod checks;
mod snapshot;

use std::{collections::BTreeSet, fmt};

use coalesce_core::ResourceId;

pub use checks::{
    BackendMatchesTable, IdleMeansUnclaimed, NoDoubleOpen, PendingGroupsIncomplete,
    SingleActivePerResource,
};
pub use snapshot::SystemSnapshot;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant, pinned to the resource it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Resource the violation was found on, if it concerns one
    pub resource: Option<ResourceId>,
    /// What went wrong
    pub message: String,
}

impl Violation {
    /// Violation of the whole system rather than one resource.
    pub fn new(invariant: &'static str, message: impl Into<String>) -> Self {
        Self { invariant, resource: None, message: message.into() }
    }

    /// Pin the violation to `resource`.
    #[must_use]
    pub fn on(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource {
            Some(id) => write!(f, "{} on resource {id}: {}", self.invariant, self.message),
            None => write!(f, "{}: {}", self.invariant, self.message),
        }
    }
}

/// Resources named by any of `violations`.
pub fn affected_resources(violations: &[Violation]) -> BTreeSet<ResourceId> {
    violations.iter().filter_map(|v| v.resource).collect()
}

impl std::error::Error for Violation {}

/// A property checked against a [`SystemSnapshot`].
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against the current state.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Registry with every standard check:
    ///
    /// - [`NoDoubleOpen`]
    /// - [`SingleActivePerResource`]
    /// - [`BackendMatchesTable`]
    /// - [`PendingGroupsIncomplete`]
    /// - [`IdleMeansUnclaimed`]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(NoDoubleOpen);
        registry.add(SingleActivePerResource);
        registry.add(BackendMatchesTable);
        registry.add(PendingGroupsIncomplete);
        registry.add(IdleMeansUnclaimed);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, collecting every violation.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation found.
    ///
    /// `context` names the step that led here, usually script source. The
    /// panic message also dumps the table and backend state.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!(
                "invariant violation after `{context}`:\n  {}\nstate:\n{state}",
                messages.join("\n  ")
            );
        }
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
