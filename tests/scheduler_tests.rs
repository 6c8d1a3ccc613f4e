//! Admission behavior of the scheduling engine, driven one cycle at a time.

use std::time::Duration;

use slotd::config::ServerConfig;
use slotd::engine::Engine;
use slotd::supervisor::Supervisor;

fn engine(slots: u32) -> Engine {
    let config = ServerConfig::new(slots, 0);
    let supervisor = Supervisor::new("SLOTD_TEST_SLOTS", 100);
    Engine::new(&config, supervisor).expect("engine")
}

fn submit(engine: &Engine, argv: &[&str], priority: bool, slots: u32) {
    engine
        .submit(argv.iter().map(|s| s.to_string()).collect(), priority, slots)
        .expect("submitted");
}

/// Tick until `pred` holds over the engine's status, or panic after ~5s.
async fn tick_until(engine: &Engine, pred: impl Fn(&slotd::engine::EngineStatus) -> bool) {
    for _ in 0..100 {
        engine.tick();
        let status = engine.status();
        if pred(&status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("engine never reached the expected state: {:?}", engine.status());
}

#[tokio::test]
async fn big_job_waits_for_the_whole_slot_set() {
    let engine = engine(2);
    submit(&engine, &["/bin/sleep", "0.3"], false, 1);
    submit(&engine, &["/bin/sleep", "0.1"], false, 2);

    engine.tick();
    let status = engine.status();
    assert_eq!(status.running, 1, "only the one-slot job starts");
    assert_eq!(status.pending, 1, "the two-slot job waits");
    assert_eq!(status.free_slots, 1);

    // A free slot exists, but the head job needs both: nothing changes.
    engine.tick();
    assert_eq!(engine.status().running, 1);
    assert_eq!(engine.status().pending, 1);

    // Once the first job exits, both slots are free and the big job runs.
    tick_until(&engine, |s| s.pending == 0 && s.running == 1 && s.free_slots == 0).await;
    tick_until(&engine, |s| s.running == 0 && s.free_slots == 2).await;
}

#[tokio::test]
async fn priority_job_runs_before_an_earlier_normal_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let order = tmp.path().join("order");
    let append = |tag: &str, pause: &str| {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo {tag} >> {}; sleep {pause}", order.display()),
        ]
    };

    let engine = engine(1);
    engine
        .submit(append("normal", "0.05"), false, 1)
        .expect("submitted");
    engine
        .submit(append("prio", "0.05"), true, 1)
        .expect("submitted");

    tick_until(&engine, |s| s.pending == 0 && s.running == 0).await;

    let contents = std::fs::read_to_string(&order).expect("order file");
    assert_eq!(contents, "prio\nnormal\n");
}

#[tokio::test]
async fn failed_spawn_returns_slots_and_later_jobs_run() {
    let engine = engine(2);
    submit(&engine, &["/no/such/binary"], false, 2);
    submit(&engine, &["/bin/sleep", "0.1"], false, 1);

    engine.tick();
    let status = engine.status();
    // The broken job is gone without holding anything; the next one runs.
    assert_eq!(status.pending, 0);
    assert_eq!(status.running, 1);
    assert_eq!(status.free_slots, 1);

    tick_until(&engine, |s| s.running == 0 && s.free_slots == 2).await;
}

#[tokio::test]
async fn oversized_job_is_rejected_not_fatal() {
    let engine = engine(2);
    submit(&engine, &["/bin/true"], false, 5);

    engine.tick();
    let status = engine.status();
    assert_eq!(status.pending, 0, "rejected job leaves the queue");
    assert_eq!(status.running, 0);
    assert_eq!(status.free_slots, 2);

    // The daemon keeps serving.
    submit(&engine, &["/bin/sleep", "0.05"], false, 2);
    engine.tick();
    assert_eq!(engine.status().running, 1);
    tick_until(&engine, |s| s.running == 0 && s.free_slots == 2).await;
}

#[tokio::test]
async fn rejected_head_does_not_block_forever() {
    let engine = engine(1);
    submit(&engine, &["/bin/true"], false, 3);
    submit(&engine, &["/bin/sleep", "0.05"], false, 1);

    // The impossible head job is rejected in the same pass that admits the
    // runnable one behind it.
    engine.tick();
    let status = engine.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.running, 1);
    tick_until(&engine, |s| s.running == 0).await;
}

#[tokio::test]
async fn slots_are_conserved_across_a_burst() {
    let engine = engine(3);
    for _ in 0..6 {
        submit(&engine, &["/bin/sleep", "0.05"], false, 1);
    }

    // However the burst interleaves with reaping, free + running always
    // covers the pool.
    for _ in 0..40 {
        engine.tick();
        let status = engine.status();
        assert_eq!(status.free_slots + status.running, 3);
        if status.pending == 0 && status.running == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let status = engine.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.free_slots, 3);
}
