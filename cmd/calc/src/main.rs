//! Pool smoke test: sum `i * (i + 1)` for `i` in `1..=count`
//!
//! Each task is computed by a worker; the completion callback adds it to a
//! running total, which must equal `count * (count + 1) * (count + 2) / 3`.
//!
//! ```text
//! calc [count]
//! ```
//!
//! # Environment Variables
//!
//! - `PROCPOOL_WORKERS` - Number of workers (default 8)
//! - `PROCPOOL_QUEUE_DEPTH` - Ring slots (default 32)
//! - `PROCPOOL_WORKER_MODE` - `process` or `thread`
//! - `RUST_LOG` - Log filter, e.g. `procpool_runtime=debug`

use procpool::{
    env_get, PoolConfig, PoolResult, TagOps, TaskNode, TaskSched, TaskSchedCtl, WakeReason,
    WorkerContext,
};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_COUNT: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct Calc {
    key: u32,
    index: u64,
    value: u64,
}

#[derive(Debug, Default)]
struct Total {
    sum: u64,
    tasks: u64,
}

fn startup(ctx: &WorkerContext<'_>) -> Result<(), procpool::BoxError> {
    info!(worker = ctx.worker_id, pid = ctx.pid, "calc worker up");
    Ok(())
}

fn cleanup(ctx: &WorkerContext<'_>) -> bool {
    info!(worker = ctx.worker_id, pid = ctx.pid, "calc worker down");
    true
}

fn handle(_sched: &TaskSched<Calc>, node: &mut TaskNode<Calc>) -> bool {
    let i = node.payload.index;
    node.payload.value = i * (i + 1);
    true
}

fn finished(node: &TaskNode<Calc>, total: &mut Total) {
    total.sum += node.payload.value;
    total.tasks += 1;
}

fn tag(task: &Calc) -> u32 {
    task.key
}

fn hash(key: &u32) -> u32 {
    key % 32
}

fn run(count: u64) -> PoolResult<Total> {
    let config = PoolConfig::from_env()
        .name("calc")
        .worker_count(env_get("PROCPOOL_WORKERS", 8))
        .queue_depth(env_get("PROCPOOL_QUEUE_DEPTH", 32));

    let mut ctl = TaskSchedCtl::create(config, TagOps::new(hash, u32::cmp), Total::default())?;
    ctl.register_handlers(startup, handle, cleanup, tag)?;
    ctl.register_completion(finished, Total::default());
    ctl.start()?;

    let mut next = 1;
    while next <= count || !ctl.is_idle() {
        let mut added = false;
        if next <= count {
            let task = Calc {
                key: (next % 256) as u32,
                index: next,
                value: 0,
            };
            added = ctl.submit(&task)?;
            if added {
                next += 1;
            }
        }
        let drained = ctl.drain_finished()?;
        if !added && drained == 0 && ctl.wait(Some(Duration::from_millis(100)))? == WakeReason::Shutdown {
            break;
        }
    }

    ctl.release()?;
    Ok(std::mem::take(ctl.context_mut()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let count = match std::env::args().nth(1).map(|s| s.parse::<u64>()) {
        None => DEFAULT_COUNT,
        Some(Ok(n)) if n > 0 => n,
        _ => {
            eprintln!("usage: calc [count]");
            return ExitCode::from(2);
        }
    };

    let start = Instant::now();
    let total = match run(count) {
        Ok(total) => total,
        Err(e) => {
            error!(error = %e, "calc failed");
            return ExitCode::FAILURE;
        }
    };
    let elapsed = start.elapsed();

    let expected = count * (count + 1) * (count + 2) / 3;
    println!(
        "calc: {} tasks, sum {} (expected {}), {:.2?}",
        total.tasks, total.sum, expected, elapsed
    );
    if total.sum != expected || total.tasks != count {
        error!(sum = total.sum, expected, "calc mismatch");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
