//! Thread-mode pool scenarios
//!
//! Workers run as threads against the same shared segment, so handler
//! instrumentation can use plain statics.

mod common;

use common::*;
use procpool::{
    noop_cleanup, noop_startup, required_pool_memory, required_shared_memory, Misuse, PoolError,
    SharedRegion, TagOps, TaskNode, TaskOutcome, TaskSched, TaskSchedCtl, WorkerMode, WorkerState,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type CalcCtl = TaskSchedCtl<CalcTask, u32, Totals>;

fn calc_ctl(workers: usize, depth: usize) -> CalcCtl {
    let mut ctl = TaskSchedCtl::create(
        config(WorkerMode::Thread, workers, depth),
        TagOps::new(tag_hash, tag_compare),
        Totals::default(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, calc_handle, noop_cleanup, calc_tag)
        .unwrap();
    ctl.register_completion(calc_finished, Totals::default());
    ctl
}

fn wait_a_bit(ctl: &mut CalcCtl) {
    ctl.wait(Some(Duration::from_millis(50))).unwrap();
}

#[test]
fn test_calc_depth32_eight_workers() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    const M: u32 = 1000;
    let mut ctl = calc_ctl(8, 32);
    ctl.start().unwrap();

    let mut next = 1;
    while next <= M {
        let added = ctl.submit(&CalcTask::new(next)).unwrap();
        if added {
            next += 1;
        }
        let removed = ctl.drain_finished().unwrap();
        if !added && removed == 0 {
            wait_a_bit(&mut ctl);
        }
    }

    loop {
        // Only this process drains, so the pool is idle exactly when every
        // task has been seen by the callback.
        assert_eq!(ctl.is_idle(), ctl.context().seen.len() == M as usize);
        if ctl.is_idle() {
            break;
        }
        if ctl.drain_finished().unwrap() == 0 {
            wait_a_bit(&mut ctl);
        }
    }

    let totals = ctl.context();
    assert_eq!(totals.sum, expected_sum(M as u64));
    assert_eq!(totals.failed, 0);

    let mut seen = totals.seen.clone();
    seen.sort_unstable();
    assert_eq!(seen, (1..=M).collect::<Vec<_>>());

    assert_eq!(ctl.release().unwrap(), 0);
    let stats = ctl.stats();
    assert_eq!(stats.tasks_completed, M as u64);
    assert_eq!(stats.workers.stopped, 8);
    assert!(ctl.partition().is_empty());
}

#[test]
fn test_depth_one_single_worker() {
    const M: u32 = 200;
    let mut ctl = calc_ctl(1, 1);
    ctl.start().unwrap();

    for i in 1..=M {
        ctl.submit_blocking(&CalcTask::new(i)).unwrap();
        // One slot: nothing else can be admitted until this one drains
        assert!(!ctl.submit(&CalcTask::new(i + 1)).unwrap());
    }
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();

    let totals = ctl.context();
    assert_eq!(totals.sum, expected_sum(M as u64));
    // Strictly sequential: drained in submission order
    assert_eq!(totals.seen, (1..=M).collect::<Vec<_>>());
}

static RUNNING: [AtomicU32; 8] = [const { AtomicU32::new(0) }; 8];
static OVERLAP: AtomicBool = AtomicBool::new(false);

fn tag_of_eight(task: &CalcTask) -> u32 {
    task.index % 8
}

fn instrumented_handle(sched: &TaskSched<CalcTask>, node: &mut TaskNode<CalcTask>) -> bool {
    let tag = (node.payload.index % 8) as usize;
    if RUNNING[tag].fetch_add(1, Ordering::SeqCst) != 0 {
        OVERLAP.store(true, Ordering::SeqCst);
    }
    thread::sleep(Duration::from_micros(200));
    let ok = calc_handle(sched, node);
    RUNNING[tag].fetch_sub(1, Ordering::SeqCst);
    ok
}

#[test]
fn test_same_tag_never_runs_concurrently() {
    const M: u32 = 400;
    let mut ctl: CalcCtl = TaskSchedCtl::create(
        config(WorkerMode::Thread, 8, 16),
        TagOps::natural(),
        Totals::default(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, instrumented_handle, noop_cleanup, tag_of_eight)
        .unwrap();
    ctl.register_completion(calc_finished, Totals::default());
    ctl.start().unwrap();

    for i in 1..=M {
        ctl.submit_blocking(&CalcTask::new(i)).unwrap();
        // At most one in-flight task per tag, so never more than 8 occupied
        assert!(ctl.stats().ring.occupied <= 8);
    }
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();

    assert!(!OVERLAP.load(Ordering::SeqCst));
    assert_eq!(ctl.context().sum, expected_sum(M as u64));
}

#[test]
fn test_submit_rejected_at_full_occupancy() {
    let mut ctl = calc_ctl(2, 4);
    // Not started: accepted tasks stay Queued and hold their slots
    for i in 1..=4 {
        assert!(ctl.submit(&CalcTask::new(i)).unwrap());
    }
    for i in 5..=20 {
        assert!(!ctl.submit(&CalcTask::new(i)).unwrap());
    }
    assert_eq!(ctl.stats().ring.occupied, 4);
    assert_eq!(ctl.partition().len(), 4);

    ctl.start().unwrap();
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();
    assert_eq!(ctl.context().sum, expected_sum(4));
}

#[test]
fn test_drain_is_idempotent() {
    let mut ctl = calc_ctl(2, 8);
    ctl.start().unwrap();
    assert_eq!(ctl.drain_finished().unwrap(), 0);

    for i in 1..=3 {
        assert!(ctl.submit(&CalcTask::new(i)).unwrap());
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while ctl.stats().ring.finished < 3 {
        assert!(Instant::now() < deadline);
        wait_a_bit(&mut ctl);
    }

    assert_eq!(ctl.drain_finished().unwrap(), 3);
    let sum = ctl.context().sum;
    let seen = ctl.context().seen.len();
    assert_eq!(ctl.drain_finished().unwrap(), 0);
    assert_eq!(ctl.context().sum, sum);
    assert_eq!(ctl.context().seen.len(), seen);
    assert!(ctl.is_idle());
    ctl.release().unwrap();
}

#[test]
fn test_release_completes_queued_tasks() {
    const M: u32 = 16;
    let mut ctl = calc_ctl(3, 16);
    for i in 1..=M {
        assert!(ctl.submit(&CalcTask::new(i)).unwrap());
    }
    ctl.start().unwrap();

    let drained = ctl.release().unwrap();
    assert_eq!(drained, M as usize);
    assert_eq!(ctl.context().sum, expected_sum(M as u64));
    assert!(ctl.is_idle());
    for w in 0..3 {
        assert_eq!(ctl.sched().worker_state(w), Some(WorkerState::Stopped));
    }
}

fn flaky_handle(sched: &TaskSched<CalcTask>, node: &mut TaskNode<CalcTask>) -> bool {
    match node.payload.index % 3 {
        0 => false,
        1 => panic!("handler blew up on {}", node.payload.index),
        _ => calc_handle(sched, node),
    }
}

#[test]
fn test_handler_failures_forwarded_not_retried() {
    let mut ctl: CalcCtl = TaskSchedCtl::create(
        config(WorkerMode::Thread, 2, 8),
        TagOps::new(tag_hash, tag_compare),
        Totals::default(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, flaky_handle, noop_cleanup, calc_tag)
        .unwrap();
    ctl.register_completion(calc_finished, Totals::default());
    ctl.start().unwrap();

    for i in 1..=30 {
        ctl.submit_blocking(&CalcTask::new(i)).unwrap();
    }
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();

    let totals = ctl.context();
    assert_eq!(totals.seen.len(), 30);
    assert_eq!(totals.failed, 20);
    assert_eq!(ctl.stats().tasks_failed, 20);
    let ok_sum: u64 = (1..=30u64).filter(|i| i % 3 == 2).map(|i| i * (i + 1)).sum();
    assert_eq!(totals.sum, ok_sum);
    // Workers survived the panics
    assert_eq!(ctl.stats().workers.stopped, 2);
}

#[test]
fn test_protocol_misuse_is_an_error() {
    let mut ctl: CalcCtl = TaskSchedCtl::create(
        config(WorkerMode::Thread, 1, 4),
        TagOps::natural(),
        Totals::default(),
    )
    .unwrap();
    assert_eq!(
        ctl.submit(&CalcTask::new(1)),
        Err(PoolError::Misuse(Misuse::HandlersNotRegistered))
    );

    ctl.register_handlers(noop_startup, calc_handle, noop_cleanup, calc_tag)
        .unwrap();
    ctl.start().unwrap();
    ctl.release().unwrap();

    assert_eq!(
        ctl.submit(&CalcTask::new(1)),
        Err(PoolError::Misuse(Misuse::Released))
    );
    assert_eq!(ctl.start(), Err(PoolError::Misuse(Misuse::Released)));
}

#[test]
fn test_invalid_config_rejected() {
    let result: Result<CalcCtl, _> = TaskSchedCtl::create(
        config(WorkerMode::Thread, 0, 4),
        TagOps::natural(),
        Totals::default(),
    );
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[test]
fn test_host_region_sizing() {
    let workers = 2;
    let depth = 8;
    let need = required_pool_memory::<CalcTask, u32>(workers, depth, 32).unwrap();
    let ring_only = required_shared_memory(workers, std::mem::size_of::<CalcTask>(), depth);
    assert!(need > ring_only);
    let host = SharedRegion::map(need).unwrap();
    let base = NonNull::new(host.base()).unwrap();

    // The partition index must fit too, not just the ring
    for short_len in [ring_only, need - 1] {
        let short = unsafe { SharedRegion::from_raw(base, short_len) };
        let result: Result<CalcCtl, _> = TaskSchedCtl::create_in(
            config(WorkerMode::Thread, workers, depth),
            short,
            TagOps::natural(),
            Totals::default(),
        );
        assert_eq!(
            result.err(),
            Some(PoolError::SizeMismatch { required: need, actual: short_len })
        );
    }

    let exact = unsafe { SharedRegion::from_raw(base, need) };
    let mut ctl: CalcCtl = TaskSchedCtl::create_in(
        config(WorkerMode::Thread, workers, depth),
        exact,
        TagOps::new(tag_hash, tag_compare),
        Totals::default(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, calc_handle, noop_cleanup, calc_tag)
        .unwrap();
    ctl.register_completion(calc_finished, Totals::default());
    ctl.start().unwrap();
    for i in 1..=50 {
        ctl.submit_blocking(&CalcTask::new(i)).unwrap();
    }
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();
    assert_eq!(ctl.context().sum, expected_sum(50));

    // Pool dropped before the host mapping goes away
    drop(ctl);
    drop(host);
}

#[test]
fn test_outcomes_visible_to_callback() {
    fn record(node: &TaskNode<CalcTask>, outcomes: &mut Vec<TaskOutcome>) {
        outcomes.push(node.outcome());
    }
    fn odd_fails(_: &TaskSched<CalcTask>, node: &mut TaskNode<CalcTask>) -> bool {
        node.payload.index % 2 == 0
    }

    let mut ctl: TaskSchedCtl<CalcTask, u32, Vec<TaskOutcome>> = TaskSchedCtl::create(
        config(WorkerMode::Thread, 1, 4),
        TagOps::natural(),
        Vec::new(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, odd_fails, noop_cleanup, calc_tag)
        .unwrap();
    ctl.register_completion(record, Vec::new());
    ctl.start().unwrap();
    for i in 1..=4 {
        ctl.submit_blocking(&CalcTask::new(i)).unwrap();
    }
    ctl.drain_until_idle().unwrap();
    ctl.release().unwrap();

    let mut outcomes = ctl.context().clone();
    outcomes.sort_by_key(|o| *o as u8);
    assert_eq!(
        outcomes,
        vec![
            TaskOutcome::Succeeded,
            TaskOutcome::Succeeded,
            TaskOutcome::Failed,
            TaskOutcome::Failed
        ]
    );
}
