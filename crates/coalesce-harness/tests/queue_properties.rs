//! Property tests for the whole queue against the simulated backend.
//!
//! proptest generates request sequences; each runs on a fresh paused-clock
//! runtime. Invariants are checked after every step, and every sequence must
//! end with all callers resolved and nothing left open after a close-all.

use std::time::Duration;

use coalesce_core::ResourceId;
use coalesce_harness::{
    InvariantRegistry, ScriptRunner, SimBackend, SimConfig, Step, SystemSnapshot,
};
use coalesce_runtime::{QueueConfig, ResourceQueue};
use proptest::prelude::*;

const RESOURCES: u32 = 4;

fn resource() -> impl Strategy<Value = ResourceId> {
    (0..RESOURCES).prop_map(ResourceId)
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => resource().prop_map(|resource| Step::Open { resource, with: Vec::new() }),
        2 => (resource(), proptest::collection::vec(resource(), 1..3))
            .prop_map(|(resource, with)| Step::Open { resource, with }),
        1 => resource().prop_map(Step::Prewarm),
        2 => resource().prop_map(Step::Close),
        1 => Just(Step::CloseAll),
        2 => resource().prop_map(Step::Release),
        3 => Just(Step::Wait),
        1 => (1u64..5000).prop_map(|ms| Step::Sleep(Duration::from_millis(ms))),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap()
}

/// Run `steps`, checking invariants after each one.
fn run_checked(steps: &[Step], sim: SimConfig) -> Result<(), TestCaseError> {
    paused_runtime().block_on(async {
        let backend = SimBackend::new(sim);
        let inspector = backend.inspector();
        let (queue, _worker) = ResourceQueue::spawn(backend, QueueConfig::default()).unwrap();
        let mut runner = ScriptRunner::new(queue);
        let registry = InvariantRegistry::standard();

        for (index, step) in steps.iter().enumerate() {
            runner.step(step).await;
            let snapshot = SystemSnapshot::capture(runner.queue().snapshot(), &inspector);
            if let Err(violations) = registry.check_all(&snapshot) {
                return Err(TestCaseError::fail(format!(
                    "after step {index} ({step}): {violations:?}\n{snapshot}"
                )));
            }
        }

        // Everything settles; only opens parked on an absent group member
        // stay in flight, and close-all disconnects those.
        runner.wait().await;
        runner.step(&Step::CloseAll).await;
        runner.wait().await;
        prop_assert_eq!(runner.in_flight(), 0);

        let snapshot = runner.queue().snapshot();
        prop_assert!(snapshot.is_empty(), "close-all left {snapshot:?}");
        prop_assert!(inspector.open_ids().is_empty());
        prop_assert_eq!(inspector.double_opens(), 0);
        prop_assert_eq!(inspector.unknown_closes(), 0);
        Ok(())
    })
}

proptest! {
    #[test]
    fn invariants_hold_for_any_sequence(
        steps in proptest::collection::vec(step(), 1..40),
    ) {
        let sim = SimConfig { latency: Duration::from_millis(5), failure_rate: 0.0, seed: 0 };
        run_checked(&steps, sim)?;
    }

    #[test]
    fn invariants_hold_under_backend_failures(
        steps in proptest::collection::vec(step(), 1..40),
        failure_rate in 0.0f64..0.6,
        seed in any::<u64>(),
    ) {
        let sim = SimConfig { latency: Duration::from_millis(5), failure_rate, seed };
        run_checked(&steps, sim)?;
    }

    #[test]
    fn repeated_opens_connect_only_the_last(
        id in resource(),
        repeats in 2usize..8,
    ) {
        let transcript = paused_runtime().block_on(async {
            let (queue, _worker) =
                ResourceQueue::spawn(SimBackend::default(), QueueConfig::default()).unwrap();
            let mut runner = ScriptRunner::new(queue);
            for _ in 0..repeats {
                runner.step(&Step::Open { resource: id, with: Vec::new() }).await;
            }
            runner.wait().await;
            runner.transcript().clone()
        });

        let lines = transcript.lines();
        prop_assert_eq!(lines.len(), repeats);
        for line in &lines[..repeats - 1] {
            prop_assert!(line.ends_with("disconnected"), "{}", line);
        }
        prop_assert!(lines[repeats - 1].contains("connected"));
        prop_assert!(!lines[repeats - 1].ends_with("disconnected"));
    }
}
