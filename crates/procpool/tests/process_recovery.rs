//! A worker process dying mid-task
//!
//! Its task comes back as `Abandoned`; the remaining workers keep going.

mod common;

use common::*;
use procpool::{noop_cleanup, noop_startup, TagOps, TaskNode, TaskOutcome, TaskSched, TaskSchedCtl, WorkerMode};
use std::time::{Duration, Instant};

const FATAL: u32 = 13;

fn fatal_handle(sched: &TaskSched<CalcTask>, node: &mut TaskNode<CalcTask>) -> bool {
    if node.payload.index == FATAL {
        unsafe { libc::_exit(9) };
    }
    calc_handle(sched, node)
}

fn record(node: &TaskNode<CalcTask>, totals: &mut Totals) {
    if node.outcome() == TaskOutcome::Abandoned {
        assert_eq!(node.payload.index, FATAL);
        assert_eq!(node.payload.value, 0);
    }
    calc_finished(node, totals);
}

#[test]
fn test_dead_worker_task_is_abandoned() {
    const M: u32 = 60;
    let mut ctl: TaskSchedCtl<CalcTask, u32, Totals> = TaskSchedCtl::create(
        config(WorkerMode::Process, 3, 8),
        TagOps::new(tag_hash, tag_compare),
        Totals::default(),
    )
    .unwrap();
    ctl.register_handlers(noop_startup, fatal_handle, noop_cleanup, calc_tag)
        .unwrap();
    ctl.register_completion(record, Totals::default());
    ctl.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut recovered = 0;
    let mut next = 1;
    while next <= M || !ctl.is_idle() {
        assert!(Instant::now() < deadline, "pool never went idle");
        let mut added = false;
        if next <= M {
            added = ctl.submit(&CalcTask::new(next)).unwrap();
            if added {
                next += 1;
            }
        }
        let drained = ctl.drain_finished().unwrap();
        recovered += ctl.recover_abandoned().unwrap();
        if !added && drained == 0 {
            ctl.wait(Some(Duration::from_millis(20))).unwrap();
        }
    }
    ctl.release().unwrap();

    assert_eq!(recovered, 1);
    let totals = ctl.context();
    assert_eq!(totals.abandoned, 1);
    assert_eq!(totals.seen.len(), M as usize);
    let fatal = FATAL as u64;
    assert_eq!(totals.sum, expected_sum(M as u64) - fatal * (fatal + 1));

    let stats = ctl.stats();
    assert_eq!(stats.tasks_abandoned, 1);
    assert_eq!(stats.workers.failed, 1);
    assert_eq!(stats.workers.stopped, 2);
}
