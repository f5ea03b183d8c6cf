//! End-to-end pool scenarios.
//!
//! Each test drives a real `AutoscaledPool` with short intervals and a
//! scripted `SystemStatusSource`, so no host sampling is involved.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::Instant;

use crawlgrid_autoscale::{AutoscaledPool, PoolError, PoolPhase};
use crawlgrid_core::PoolConfig;
use crawlgrid_status::{ResourceLoad, SystemStatusReport, SystemStatusSource};

struct ScriptedStatus {
    idle: AtomicBool,
}

impl ScriptedStatus {
    fn idle() -> Arc<Self> {
        Arc::new(Self {
            idle: AtomicBool::new(true),
        })
    }

    fn report(&self) -> SystemStatusReport {
        let idle = self.idle.load(Ordering::SeqCst);
        let load = ResourceLoad {
            is_overloaded: !idle,
            limit_ratio: 0.4,
            actual_ratio: if idle { 0.0 } else { 1.0 },
        };
        SystemStatusReport::from_loads(load, load, load, load)
    }
}

impl SystemStatusSource for ScriptedStatus {
    fn current_status(&self) -> SystemStatusReport {
        self.report()
    }

    fn historical_status(&self) -> SystemStatusReport {
        self.report()
    }
}

fn fast_config() -> PoolConfig {
    PoolConfig {
        maybe_run_interval_secs: 0.01,
        autoscale_interval_secs: 0.05,
        logging_interval_secs: None,
        ..PoolConfig::default()
    }
}

/// Hands out `0..limit`, one per ready check.
struct Queue {
    next: AtomicUsize,
    limit: usize,
}

impl Queue {
    fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            next: AtomicUsize::new(0),
            limit,
        })
    }

    fn has_next(&self) -> bool {
        self.next.load(Ordering::SeqCst) < self.limit
    }

    fn take(&self) -> Option<usize> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        (n < self.limit).then_some(n)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_slot_pool_runs_tasks_in_order() {
    let config = PoolConfig {
        min_concurrency: 1,
        max_concurrency: 1,
        ..fast_config()
    };
    let queue = Queue::new(10);
    let output = Arc::new(Mutex::new(Vec::new()));

    let (q_run, q_ready, q_done, out) =
        (queue.clone(), queue.clone(), queue.clone(), output.clone());
    let pool = AutoscaledPool::builder(config)
        .run_task(move || {
            let (queue, out) = (q_run.clone(), out.clone());
            async move {
                if let Some(n) = queue.take() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    out.lock().unwrap().push(n);
                }
                Ok(())
            }
        })
        .is_task_ready(move || {
            let queue = q_ready.clone();
            async move { Ok(queue.has_next()) }
        })
        .is_finished(move || {
            let queue = q_done.clone();
            async move { Ok(!queue.has_next()) }
        })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    pool.run().await.unwrap();

    assert_eq!(*output.lock().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(pool.state().phase, PoolPhase::Finished);
    assert_eq!(pool.current_concurrency(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_task_times_out_promptly() {
    let config = PoolConfig {
        task_timeout_secs: 0.1,
        ..fast_config()
    };
    let pool = AutoscaledPool::builder(config)
        .run_task(|| async {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            Ok(())
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let started = Instant::now();
    let err = pool.run().await.unwrap_err();

    assert!(matches!(err, PoolError::Timeout { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(pool.state().phase, PoolPhase::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_from_inside_a_task_resolves_run() {
    let handle: Arc<OnceLock<AutoscaledPool>> = Arc::new(OnceLock::new());
    let finished_checks = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let (h, r) = (handle.clone(), runs.clone());
    let checks = finished_checks.clone();
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(move || {
            let (h, r) = (h.clone(), r.clone());
            async move {
                if r.fetch_add(1, Ordering::SeqCst) == 0
                    && let Some(pool) = h.get()
                {
                    pool.abort();
                }
                Ok(())
            }
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(move || {
            checks.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();
    assert!(handle.set(pool.clone()).is_ok());

    pool.run().await.unwrap();
    assert!(pool.state().is_aborted());

    // Nothing consults is_finished after an abort.
    let seen = finished_checks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(finished_checks.load(Ordering::SeqCst), seen);
    assert!(pool.state().is_aborted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_stays_within_bounds() {
    let config = PoolConfig {
        min_concurrency: 2,
        max_concurrency: 8,
        ..fast_config()
    };
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let pool_slot: Arc<OnceLock<AutoscaledPool>> = Arc::new(OnceLock::new());

    let (f, p, v, slot) = (
        in_flight.clone(),
        peak.clone(),
        violations.clone(),
        pool_slot.clone(),
    );
    let pool = AutoscaledPool::builder(config)
        .run_task(move || {
            let (f, p, v, slot) = (f.clone(), p.clone(), v.clone(), slot.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                if let Some(pool) = slot.get() {
                    let state = pool.state();
                    if state.current_concurrency > state.desired_concurrency
                        || state.current_concurrency > state.max_concurrency
                    {
                        v.fetch_add(1, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();
    assert!(pool_slot.set(pool.clone()).is_ok());

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });

    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = pool.state();
        assert!(state.min_concurrency <= state.desired_concurrency);
        assert!(state.desired_concurrency <= state.max_concurrency);
        assert!(state.current_concurrency <= state.desired_concurrency);
    }
    pool.abort();
    run.await.unwrap().unwrap();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(peak.load(Ordering::SeqCst) <= 8);
    // An idle system with saturated slots scales past the minimum.
    assert!(peak.load(Ordering::SeqCst) > 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overloaded_system_scales_down_to_min() {
    let config = PoolConfig {
        min_concurrency: 1,
        max_concurrency: 10,
        desired_concurrency: Some(10),
        scale_down_step_ratio: 0.5,
        ..fast_config()
    };
    let status = ScriptedStatus::idle();
    status.idle.store(false, Ordering::SeqCst);

    let pool = AutoscaledPool::builder(config)
        .run_task(|| async { Ok(()) })
        .is_task_ready(|| async { Ok(false) })
        .is_finished(|| async { Ok(false) })
        .system_status(status)
        .build()
        .unwrap();

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.desired_concurrency(), 1);

    pool.abort();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scale_down_holds_launches_until_in_flight_tasks_settle() {
    let config = PoolConfig {
        min_concurrency: 1,
        max_concurrency: 8,
        desired_concurrency: Some(8),
        scale_down_step_ratio: 0.5,
        ..fast_config()
    };
    let status = ScriptedStatus::idle();
    let launches = Arc::new(AtomicUsize::new(0));

    let counter = launches.clone();
    let pool = AutoscaledPool::builder(config)
        .run_task(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(600)).await;
                Ok(())
            }
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(status.clone())
        .build()
        .unwrap();

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(pool.current_concurrency(), 8);

    status.idle.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;
    let state = pool.state();
    assert!(state.desired_concurrency < 8, "desired should have dropped");
    assert_eq!(state.current_concurrency, 8);
    let launched = launches.load(Ordering::SeqCst);

    // Slots stay over-committed, so nothing new may start.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let state = pool.state();
        assert!(state.current_concurrency >= state.desired_concurrency);
        assert_eq!(launches.load(Ordering::SeqCst), launched);
    }

    pool.abort();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_error_fails_run() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async { Err(anyhow!("upstream refused")) })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let err = pool.run().await.unwrap_err();
    assert!(matches!(err, PoolError::Task(_)));
    assert!(err.to_string().contains("upstream refused"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ready_check_error_fails_run() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async { Ok(()) })
        .is_task_ready(|| async { Err(anyhow!("queue unreachable")) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let err = pool.run().await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Predicate {
            predicate: "is_task_ready",
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_check_error_fails_run() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async { Ok(()) })
        .is_task_ready(|| async { Ok(false) })
        .is_finished(|| async { Err(anyhow!("storage offline")) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let err = pool.run().await.unwrap_err();
    assert!(matches!(
        err,
        PoolError::Predicate {
            predicate: "is_finished",
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_ready_check_fails_run() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async { Ok(()) })
        .is_task_ready(|| async {
            if true {
                panic!("ready check exploded");
            }
            Ok(true)
        })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), pool.run())
        .await
        .expect("run() must resolve")
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Predicate {
            predicate: "is_task_ready",
            ..
        }
    ));
    assert_eq!(pool.state().phase, PoolPhase::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_finished_check_fails_run() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async { Ok(()) })
        .is_task_ready(|| async { Ok(false) })
        .is_finished(|| async {
            if true {
                panic!("finished check exploded");
            }
            Ok(false)
        })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), pool.run())
        .await
        .expect("run() must resolve")
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Predicate {
            predicate: "is_finished",
            ..
        }
    ));
    assert!(err.to_string().contains("panicked"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_before_run_starts_paused() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    pool.pause().await;
    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(pool.state().is_paused());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    pool.resume();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(runs.load(Ordering::SeqCst) > 0);

    pool.abort();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_drains_and_resume_continues() {
    let queue = Queue::new(40);
    let in_flight = Arc::new(AtomicUsize::new(0));

    let (q_run, q_ready, q_done, f) =
        (queue.clone(), queue.clone(), queue.clone(), in_flight.clone());
    let pool = AutoscaledPool::builder(PoolConfig {
        min_concurrency: 4,
        max_concurrency: 4,
        ..fast_config()
    })
    .run_task(move || {
        let (queue, f) = (q_run.clone(), f.clone());
        async move {
            if queue.take().is_some() {
                f.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                f.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }
    })
    .is_task_ready(move || {
        let queue = q_ready.clone();
        async move { Ok(queue.has_next()) }
    })
    .is_finished(move || {
        let queue = q_done.clone();
        async move { Ok(!queue.has_next()) }
    })
    .system_status(ScriptedStatus::idle())
    .build()
    .unwrap();

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(25)).await;
    pool.pause().await;
    assert!(pool.state().is_paused());
    assert_eq!(pool.current_concurrency(), 0);
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);

    // A paused pool neither launches nor finishes.
    let taken = queue.next.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.next.load(Ordering::SeqCst), taken);
    assert!(!run.is_finished());

    pool.resume();
    run.await.unwrap().unwrap();
    assert_eq!(pool.state().phase, PoolPhase::Finished);
    assert!(!queue.has_next());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_with_timeout_reports_stuck_tasks() {
    let pool = AutoscaledPool::builder(fast_config())
        .run_task(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .is_task_ready(|| async { Ok(true) })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = pool
        .pause_with_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DrainTimeout { .. }));
    assert!(pool.state().is_paused());

    pool.abort();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notify_launches_without_waiting_for_tick() {
    let config = PoolConfig {
        // Neither periodic loop fires during the test.
        maybe_run_interval_secs: 3600.0,
        autoscale_interval_secs: 3600.0,
        ..fast_config()
    };
    let ready = Arc::new(AtomicBool::new(false));
    let runs = Arc::new(AtomicUsize::new(0));

    let (rd, rn) = (ready.clone(), runs.clone());
    let pool = AutoscaledPool::builder(config)
        .run_task(move || {
            let rn = rn.clone();
            async move {
                rn.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .is_task_ready(move || {
            let rd = rd.clone();
            async move { Ok(rd.swap(false, Ordering::SeqCst)) }
        })
        .is_finished(|| async { Ok(false) })
        .system_status(ScriptedStatus::idle())
        .build()
        .unwrap();

    let runner = pool.clone();
    let run = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    ready.store(true, Ordering::SeqCst);
    pool.notify();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    pool.abort();
    run.await.unwrap().unwrap();
}
