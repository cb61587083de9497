//! In-memory backend with latency and fault injection.
//!
//! Failures come from two sources: scripted per-resource failures queued with
//! [`SimInspector::fail_next`], and a seeded random failure rate. Random
//! failures are reported as [`ResourceError::Busy`] so the worker's retry
//! policy gets exercised. The same seed reproduces the same failures.
//!
//! The backend also checks the contract the worker promises: it counts every
//! open of an id that is already open, and every close of an opening it never
//! handed out.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use coalesce_core::{ResourceError, ResourceHandle, ResourceId};
use coalesce_runtime::ResourceBackend;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Error code reported for random contention failures (`EBUSY`).
pub const SIM_BUSY_CODE: i32 = 16;

/// Simulated backend configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimConfig {
    /// Time each open takes
    pub latency: Duration,
    /// Probability that an open fails with a transient error, clamped to
    /// [0, 1]. NaN disables random failures.
    pub failure_rate: f64,
    /// RNG seed for random failures
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { latency: Duration::from_millis(5), failure_rate: 0.0, seed: 0 }
    }
}

/// Something the backend did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Open succeeded
    Opened(ResourceId),
    /// Open failed with the given error
    OpenFailed(ResourceError),
    /// Opening closed
    Closed(ResourceHandle),
}

/// Object handed out by [`SimBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimResource {
    /// Resource this was opened for
    pub id: ResourceId,
    /// Position among all successful opens, starting at 0
    pub serial: u64,
}

#[derive(Debug)]
struct SimState {
    rng: ChaCha8Rng,
    failure_rate: f64,
    scripted: HashMap<ResourceId, VecDeque<ResourceError>>,
    /// Open resources and the serial of their current opening
    open: BTreeMap<ResourceId, u64>,
    events: Vec<SimEvent>,
    next_serial: u64,
    double_opens: usize,
    unknown_closes: usize,
}

impl SimState {
    fn open(&mut self, id: ResourceId) -> Result<SimResource, ResourceError> {
        let failure = match self.scripted.get_mut(&id).and_then(VecDeque::pop_front) {
            Some(err) => Some(err),
            None if self.rng.gen_bool(self.failure_rate) => {
                Some(ResourceError::Busy { resource: id, code: SIM_BUSY_CODE })
            },
            None => None,
        };
        if let Some(err) = failure {
            tracing::debug!(resource = %id, error = %err, "sim open failed");
            self.events.push(SimEvent::OpenFailed(err));
            return Err(err);
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        if self.open.insert(id, serial).is_some() {
            tracing::error!(resource = %id, "sim resource opened twice");
            self.double_opens += 1;
        }
        self.events.push(SimEvent::Opened(id));
        Ok(SimResource { id, serial })
    }

    fn close(&mut self, handle: ResourceHandle, serial: u64) {
        match self.open.get(&handle.id) {
            Some(current) if *current == serial => {
                self.open.remove(&handle.id);
            },
            _ => {
                tracing::error!(%handle, "sim close of an opening that is not current");
                self.unknown_closes += 1;
            },
        }
        self.events.push(SimEvent::Closed(handle));
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated [`ResourceBackend`].
///
/// Cheap to clone; clones share state. Obtain a [`SimInspector`] before
/// handing the backend to the queue.
#[derive(Debug, Clone)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
    latency: Duration,
}

impl SimBackend {
    /// Create a backend with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            failure_rate: if config.failure_rate.is_nan() {
                0.0
            } else {
                config.failure_rate.clamp(0.0, 1.0)
            },
            scripted: HashMap::new(),
            open: BTreeMap::new(),
            events: Vec::new(),
            next_serial: 0,
            double_opens: 0,
            unknown_closes: 0,
        };
        Self { state: Arc::new(Mutex::new(state)), latency: config.latency }
    }

    /// Observer sharing this backend's state.
    pub fn inspector(&self) -> SimInspector {
        SimInspector { state: Arc::clone(&self.state) }
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl ResourceBackend for SimBackend {
    type Resource = SimResource;

    async fn open(&mut self, id: ResourceId) -> Result<SimResource, ResourceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        lock(&self.state).open(id)
    }

    async fn close(&mut self, handle: ResourceHandle, resource: Arc<SimResource>) {
        lock(&self.state).close(handle, resource.serial);
    }
}

/// Read access to a [`SimBackend`], plus scripted failures.
#[derive(Debug, Clone)]
pub struct SimInspector {
    state: Arc<Mutex<SimState>>,
}

impl SimInspector {
    /// Make the next open of `id` fail with `err`. Queued per resource.
    pub fn fail_next(&self, id: ResourceId, err: ResourceError) {
        lock(&self.state).scripted.entry(id).or_default().push_back(err);
    }

    /// Resources the backend currently holds open.
    pub fn open_ids(&self) -> BTreeSet<ResourceId> {
        lock(&self.state).open.keys().copied().collect()
    }

    /// Everything the backend did, oldest first.
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state).events.clone()
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        lock(&self.state).events.iter().filter(|e| matches!(e, SimEvent::Opened(_))).count()
    }

    /// Closes so far.
    pub fn closes(&self) -> usize {
        lock(&self.state).events.iter().filter(|e| matches!(e, SimEvent::Closed(_))).count()
    }

    /// Opens of an id that was already open.
    pub fn double_opens(&self) -> usize {
        lock(&self.state).double_opens
    }

    /// Closes of an opening that was not current.
    pub fn unknown_closes(&self) -> usize {
        lock(&self.state).unknown_closes
    }
}
