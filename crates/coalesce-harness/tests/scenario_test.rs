//! Scripted scenarios against the simulated backend.
//!
//! Each scenario runs a request script on a paused clock and checks the
//! transcript, the published table, and the standard invariants.

use std::time::Duration;

use coalesce_core::{ResourceError, ResourceId};
use coalesce_harness::{
    InvariantRegistry, SIM_BUSY_CODE, Script, ScriptRunner, SimBackend, SimConfig, SimInspector,
    SimResource, SystemSnapshot,
};
use coalesce_runtime::{QueueConfig, ResourceQueue};

fn start(config: QueueConfig, sim: SimConfig) -> (ScriptRunner<SimResource>, SimInspector) {
    let backend = SimBackend::new(sim);
    let inspector = backend.inspector();
    let (queue, _worker) = ResourceQueue::spawn(backend, config).unwrap();
    (ScriptRunner::new(queue), inspector)
}

async fn run(runner: &mut ScriptRunner<SimResource>, inspector: &SimInspector, source: &str) {
    let script = Script::parse(source).unwrap();
    runner.run(&script).await;

    let snapshot = SystemSnapshot::capture(runner.queue().snapshot(), inspector);
    InvariantRegistry::standard().assert_all(&snapshot, source);
}

fn lines(runner: &ScriptRunner<SimResource>) -> Vec<&str> {
    runner.transcript().lines().iter().map(String::as_str).collect()
}

#[tokio::test(start_paused = true)]
async fn repeated_open_only_last_connects() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0; open 0; wait").await;

    assert_eq!(lines(&runner), vec!["open 0 [t0]: disconnected", "open 0 [t1]: connected 0#0"]);
    assert_eq!(inspector.opens(), 1);
    assert_eq!(runner.held(ResourceId(0)), 1);
}

#[tokio::test(start_paused = true)]
async fn close_all_discards_batch() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0\nopen 1\nprewarm 2\nclose-all\nwait").await;

    assert_eq!(lines(&runner), vec![
        "open 0 [t0]: disconnected",
        "open 1 [t1]: disconnected",
        "prewarm 2 [t2]: done",
        "close-all [t3]: done",
    ]);
    assert_eq!(inspector.opens(), 0);
    assert!(runner.queue().snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_all_after_opens_revokes_everything() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0; open 1; wait; close-all; wait").await;

    assert_eq!(runner.revoked(), 2);
    assert_eq!(inspector.closes(), 2);
    assert!(runner.queue().snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_group_connects_together() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0 with 1; open 1 with 0; wait").await;

    assert_eq!(lines(&runner), vec![
        "open 0 with 1 [t0]: connected 0#0",
        "open 1 with 0 [t1]: connected 1#1",
    ]);
}

#[tokio::test(start_paused = true)]
async fn group_open_parks_until_partner_arrives() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0 with 1; wait").await;
    assert_eq!(lines(&runner), vec!["open 0 with 1 [t0]: parked"]);
    assert_eq!(runner.in_flight(), 1);

    run(&mut runner, &inspector, "open 1 with 0; wait").await;
    assert_eq!(lines(&runner), vec![
        "open 0 with 1 [t0]: parked",
        "open 0 with 1 [t0]: connected 0#0",
        "open 1 with 0 [t1]: connected 1#1",
    ]);
    assert_eq!(runner.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn closing_member_disconnects_parked_group() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0 with 1; wait; close 1; wait").await;

    assert_eq!(lines(&runner), vec![
        "open 0 with 1 [t0]: parked",
        "open 0 with 1 [t0]: disconnected",
        "close 1 [t1]: done",
    ]);
    assert_eq!(runner.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn switching_groups_closes_old_group_first() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0 with 1; open 1 with 0; wait; open 2; wait").await;

    assert_eq!(runner.revoked(), 2);
    assert_eq!(runner.queue().snapshot().active_ids(), vec![ResourceId(2)]);
    assert_eq!(inspector.double_opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_then_open_in_one_batch() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0; wait; close 0; open 0; wait").await;

    assert_eq!(lines(&runner), vec![
        "open 0 [t0]: connected 0#0",
        "close 0 [t1]: done",
        "open 0 [t2]: connected 0#1",
    ]);
    assert_eq!(runner.revoked(), 1);
}

#[tokio::test(start_paused = true)]
async fn released_resource_closes_after_idle_timeout() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0; wait; release 0; sleep 1000").await;
    assert_eq!(runner.queue().snapshot().active_ids(), vec![ResourceId(0)]);

    run(&mut runner, &inspector, "sleep 2500").await;
    assert!(runner.queue().snapshot().is_empty());
    assert!(lines(&runner).contains(&"release 0: 1 leases released"));
}

#[tokio::test(start_paused = true)]
async fn reopening_before_expiry_keeps_resource() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "open 0; wait; release 0; sleep 2000; open 0; wait; sleep 5000")
        .await;

    assert_eq!(inspector.opens(), 1);
    assert_eq!(inspector.closes(), 0);
    assert_eq!(runner.held(ResourceId(0)), 1);
}

#[tokio::test(start_paused = true)]
async fn prewarm_expires_unless_claimed() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());

    run(&mut runner, &inspector, "prewarm 3; wait; sleep 4000").await;

    assert_eq!(inspector.opens(), 1);
    assert_eq!(inspector.closes(), 1);
    assert!(runner.queue().snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn busy_backend_is_retried() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());
    for _ in 0..2 {
        inspector.fail_next(ResourceId(0), ResourceError::Busy {
            resource: ResourceId(0),
            code: SIM_BUSY_CODE,
        });
    }

    run(&mut runner, &inspector, "open 0; wait").await;

    assert_eq!(lines(&runner), vec!["open 0 [t0]: connected 0#0"]);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_reaches_caller() {
    let (mut runner, inspector) = start(QueueConfig::default(), SimConfig::default());
    inspector.fail_next(ResourceId(2), ResourceError::Unavailable {
        resource: ResourceId(2),
        code: 13,
    });

    run(&mut runner, &inspector, "open 2; wait").await;

    assert_eq!(lines(&runner), vec![
        "open 2 [t0]: failed (resource 2 unavailable (error code 13))"
    ]);
    assert!(runner.queue().snapshot().is_empty());
}

#[tokio::test(start_paused = true)]
async fn overflow_is_rejected_at_submission() {
    let config = QueueConfig { capacity: 2, ..Default::default() };
    let (mut runner, inspector) = start(config, SimConfig::default());

    run(&mut runner, &inspector, "open 0; open 1; open 2; wait").await;

    assert_eq!(lines(&runner), vec![
        "open 2: rejected (request queue full, resource 2 not opened)",
        "open 0 [t0]: connected 0#0",
        "open 1 [t1]: connected 1#1",
    ]);
}

#[tokio::test(start_paused = true)]
async fn seeded_chaos_is_reproducible() {
    let sim = SimConfig { latency: Duration::from_millis(3), failure_rate: 0.4, seed: 42 };
    let source = "open 0; open 1; wait; close 0; open 2 with 3; open 3 with 2; wait; sleep 200; \
                  open 0; close-all; open 1; wait";

    let mut transcripts = Vec::new();
    for _ in 0..2 {
        let (mut runner, inspector) = start(QueueConfig::default(), sim);
        run(&mut runner, &inspector, source).await;
        transcripts.push(runner.transcript().clone());
    }

    assert_eq!(transcripts[0], transcripts[1]);
}
