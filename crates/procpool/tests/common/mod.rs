//! Shared calculation workload for integration tests
//!
//! Task `i` computes `i * (i + 1)`; summing over `1..=m` gives
//! `m * (m + 1) * (m + 2) / 3`.

#![allow(dead_code)]

use procpool::{PoolConfig, TaskNode, TaskOutcome, TaskSched, WorkerMode};
use std::cmp::Ordering;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalcTask {
    pub key: u32,
    pub index: u32,
    pub value: u64,
    /// Process that ran the handler
    pub worker_pid: i32,
}

impl CalcTask {
    pub fn new(index: u32) -> Self {
        Self {
            key: index % 256,
            index,
            value: 0,
            worker_pid: 0,
        }
    }
}

/// Aggregation context kept by each client process
#[derive(Debug, Default)]
pub struct Totals {
    pub sum: u64,
    pub seen: Vec<u32>,
    pub failed: usize,
    pub abandoned: usize,
    /// Completions whose handler ran in a different process
    pub remote: usize,
}

pub fn expected_sum(m: u64) -> u64 {
    m * (m + 1) * (m + 2) / 3
}

pub fn calc_handle(_sched: &TaskSched<CalcTask>, node: &mut TaskNode<CalcTask>) -> bool {
    let i = node.payload.index as u64;
    node.payload.value = i * (i + 1);
    node.payload.worker_pid = std::process::id() as i32;
    true
}

pub fn calc_finished(node: &TaskNode<CalcTask>, totals: &mut Totals) {
    match node.outcome() {
        TaskOutcome::Succeeded => totals.sum += node.payload.value,
        TaskOutcome::Abandoned => totals.abandoned += 1,
        _ => totals.failed += 1,
    }
    if node.payload.worker_pid != 0 && node.payload.worker_pid != std::process::id() as i32 {
        totals.remote += 1;
    }
    totals.seen.push(node.payload.index);
}

pub fn calc_tag(task: &CalcTask) -> u32 {
    task.key
}

pub fn tag_hash(key: &u32) -> u32 {
    key % 32
}

pub fn tag_compare(a: &u32, b: &u32) -> Ordering {
    a.cmp(b)
}

pub fn config(mode: WorkerMode, workers: usize, depth: usize) -> PoolConfig {
    PoolConfig::new()
        .name("calc-test")
        .worker_count(workers)
        .queue_depth(depth)
        .buckets(32)
        .worker_mode(mode)
        .startup_timeout(Duration::from_secs(10))
}
