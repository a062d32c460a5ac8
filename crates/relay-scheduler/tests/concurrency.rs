// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end concurrency behavior of the scheduler under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_config::SchedulerConfig;
use relay_scheduler::{Scheduler, TaskPriority};
use serde_json::json;

/// 25 tasks of ~100 ms each through a 10-slot pool must take at least three
/// waves (≥ 300 ms) but nowhere near serial execution (< 600 ms), and the
/// observed parallelism must never exceed the bound.
#[tokio::test]
async fn twenty_five_tasks_run_in_three_waves() {
    let scheduler = Scheduler::new(SchedulerConfig { max_concurrent: 10 });
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..25 {
        let live = Arc::clone(&live);
        let peak = Arc::clone(&peak);
        scheduler.schedule(
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(i))
            },
            TaskPriority::High,
            None,
        );
    }

    let start = Instant::now();
    let results = scheduler.execute_pending(None).await;
    let elapsed = start.elapsed();

    assert_eq!(results.len(), 25);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(
        elapsed >= Duration::from_millis(300),
        "three waves of 100 ms each cannot finish faster than 300 ms: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(600),
        "ten-wide pool should finish 25×100 ms tasks well under 600 ms: {elapsed:?}"
    );
    assert!(
        peak.load(Ordering::SeqCst) <= 10,
        "parallelism bound violated: peak {}",
        peak.load(Ordering::SeqCst)
    );
    assert_eq!(scheduler.stats().completed, 25);
    assert_eq!(scheduler.stats().running, 0);
}

/// Sampled `stats().running` never reports more than the bound while a
/// saturating batch is in flight.
#[tokio::test]
async fn sampled_running_count_stays_within_bound() {
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig { max_concurrent: 4 }));
    for _ in 0..12 {
        scheduler.schedule(
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!(null))
            },
            TaskPriority::Normal,
            None,
        );
    }

    let sampler = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            let mut max_seen = 0;
            for _ in 0..30 {
                max_seen = max_seen.max(scheduler.stats().running);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            max_seen
        })
    };

    scheduler.execute_pending(None).await;
    let max_seen = sampler.await.expect("sampler task");
    assert!(max_seen <= 4, "sampled running={max_seen} exceeds bound 4");
}

/// Higher-priority tasks start no later than lower-priority ones: with a
/// single slot, a Critical task scheduled after a Low task still runs first.
#[tokio::test]
async fn priority_orders_start_times() {
    let scheduler = Scheduler::new(SchedulerConfig { max_concurrent: 1 });
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for (label, priority) in [
        ("low", TaskPriority::Low),
        ("critical", TaskPriority::Critical),
        ("normal", TaskPriority::Normal),
    ] {
        let order = Arc::clone(&order);
        scheduler.schedule(
            async move {
                order.lock().expect("order lock").push(label);
                Ok(json!(label))
            },
            priority,
            None,
        );
    }

    scheduler.execute_pending(None).await;
    let order = order.lock().expect("order lock").clone();
    assert_eq!(order, vec!["critical", "normal", "low"]);
}
