//! Autoscaled pool — runs caller-supplied tasks under a self-tuning
//! concurrency limit.
//!
//! All mutable scheduling state lives in one mutex-guarded `Shared`
//! struct that is never held across an await. Callbacks, tasks and the
//! two periodic loops run as separate tokio tasks that report back by
//! taking the lock briefly.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crawlgrid_core::{ConfigError, PoolConfig, SnapshotterConfig, SystemStatusConfig};
use crawlgrid_snapshot::{RateLimitErrorSource, Snapshotter};
use crawlgrid_status::{SystemStatus, SystemStatusSource};

use crate::error::{PoolError, PoolResult};
use crate::scaler::{self, ScaleDecision, ScaleInput};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Executes one task. An error fails the whole pool.
pub type RunTaskFn = Arc<dyn Fn() -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// Answers `is_task_ready` or `is_finished`. An error fails the whole pool.
pub type PredicateFn = Arc<dyn Fn() -> BoxFuture<anyhow::Result<bool>> + Send + Sync>;

const TASK_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Lifecycle of a pool.
///
/// ```text
/// Created → Running ⇄ Paused → Finished | Aborted | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Created,
    Running,
    Paused,
    Finished,
    Aborted,
    Failed,
}

impl PoolPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PoolPhase::Finished | PoolPhase::Aborted | PoolPhase::Failed
        )
    }
}

/// Point-in-time view of the pool's concurrency figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub phase: PoolPhase,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub current_concurrency: usize,
}

impl PoolState {
    pub fn is_paused(&self) -> bool {
        self.phase == PoolPhase::Paused
    }

    pub fn is_aborted(&self) -> bool {
        self.phase == PoolPhase::Aborted
    }
}

struct Shared {
    phase: PoolPhase,
    min_concurrency: usize,
    max_concurrency: usize,
    desired_concurrency: usize,
    current_concurrency: usize,
    /// An `is_task_ready` call is in flight.
    querying_ready: bool,
    /// An `is_finished` call is in flight.
    querying_finished: bool,
    /// `pause()` was called before `run()`.
    start_paused: bool,
    /// Task start times, kept only when `max_tasks_per_minute` is set.
    task_starts: VecDeque<Instant>,
    last_logged: Option<Instant>,
}

struct PoolInner {
    config: PoolConfig,
    run_task: RunTaskFn,
    is_task_ready: PredicateFn,
    is_finished: PredicateFn,
    status: Arc<dyn SystemStatusSource>,
    shared: Mutex<Shared>,
    /// Signalled whenever `current_concurrency` drops to zero.
    drained: Notify,
    /// Resolves the pending `run()`.
    outcome: Mutex<Option<oneshot::Sender<PoolResult<()>>>>,
}

/// Runs tasks at a concurrency retuned from system status.
///
/// Cloning is cheap and every clone controls the same pool, so a task can
/// hold a clone to `pause`, `abort` or `notify` it.
#[derive(Clone)]
pub struct AutoscaledPool {
    inner: Arc<PoolInner>,
}

/// Builder for `AutoscaledPool`.
pub struct AutoscaledPoolBuilder {
    config: PoolConfig,
    run_task: Option<RunTaskFn>,
    is_task_ready: Option<PredicateFn>,
    is_finished: Option<PredicateFn>,
    status: Option<Arc<dyn SystemStatusSource>>,
    status_config: SystemStatusConfig,
    snapshotter_config: SnapshotterConfig,
    rate_limit_source: Option<Arc<dyn RateLimitErrorSource>>,
}

impl AutoscaledPoolBuilder {
    pub fn run_task<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.run_task = Some(Arc::new(move || Box::pin(f())));
        self
    }

    pub fn is_task_ready<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.is_task_ready = Some(Arc::new(move || Box::pin(f())));
        self
    }

    pub fn is_finished<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.is_finished = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Use these verdicts instead of a host-probing `SystemStatus`.
    pub fn system_status(mut self, status: Arc<dyn SystemStatusSource>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn system_status_config(mut self, config: SystemStatusConfig) -> Self {
        self.status_config = config;
        self
    }

    pub fn snapshotter_config(mut self, config: SnapshotterConfig) -> Self {
        self.snapshotter_config = config;
        self
    }

    /// Client whose rate-limit errors feed the default snapshotter.
    pub fn rate_limit_source(mut self, source: Arc<dyn RateLimitErrorSource>) -> Self {
        self.rate_limit_source = Some(source);
        self
    }

    pub fn build(self) -> PoolResult<AutoscaledPool> {
        self.config.validate()?;

        let run_task = self
            .run_task
            .ok_or_else(|| ConfigError::invalid("run_task", "a task function is required"))?;
        let is_task_ready = self.is_task_ready.ok_or_else(|| {
            ConfigError::invalid("is_task_ready", "a readiness function is required")
        })?;
        let is_finished = self.is_finished.ok_or_else(|| {
            ConfigError::invalid("is_finished", "a completion function is required")
        })?;

        let status: Arc<dyn SystemStatusSource> = match self.status {
            Some(status) => status,
            None => {
                let mut snapshotter = Snapshotter::builder(self.snapshotter_config).os_probe();
                if let Some(source) = self.rate_limit_source {
                    snapshotter = snapshotter.rate_limit_source(source);
                }
                let snapshotter = snapshotter.build()?;
                Arc::new(SystemStatus::new(Arc::new(snapshotter), self.status_config)?)
            }
        };

        let desired = self.config.initial_desired_concurrency();
        Ok(AutoscaledPool {
            inner: Arc::new(PoolInner {
                shared: Mutex::new(Shared {
                    phase: PoolPhase::Created,
                    min_concurrency: self.config.min_concurrency,
                    max_concurrency: self.config.max_concurrency,
                    desired_concurrency: desired,
                    current_concurrency: 0,
                    querying_ready: false,
                    querying_finished: false,
                    start_paused: false,
                    task_starts: VecDeque::new(),
                    last_logged: None,
                }),
                config: self.config,
                run_task,
                is_task_ready,
                is_finished,
                status,
                drained: Notify::new(),
                outcome: Mutex::new(None),
            }),
        })
    }
}

/// Stops the periodic loops and the snapshotter when `run()` returns or
/// is dropped.
struct RunGuard {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    snapshotter: Option<Arc<Snapshotter>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        if let Some(snapshotter) = &self.snapshotter {
            snapshotter.stop();
        }
    }
}

impl AutoscaledPool {
    pub fn builder(config: PoolConfig) -> AutoscaledPoolBuilder {
        AutoscaledPoolBuilder {
            config,
            run_task: None,
            is_task_ready: None,
            is_finished: None,
            status: None,
            status_config: SystemStatusConfig::default(),
            snapshotter_config: SnapshotterConfig::default(),
            rate_limit_source: None,
        }
    }

    /// Run tasks until `is_finished` reports true with nothing in flight,
    /// the pool is aborted, or a callback fails.
    ///
    /// A pool runs once; a second call returns `AlreadyStarted`. A pool
    /// aborted before it started returns `Ok(())` straight away.
    pub async fn run(&self) -> PoolResult<()> {
        let outcome_rx = {
            let mut shared = self.inner.lock_shared();
            match shared.phase {
                PoolPhase::Created => {}
                PoolPhase::Aborted => return Ok(()),
                _ => return Err(PoolError::AlreadyStarted),
            }
            shared.phase = if shared.start_paused {
                PoolPhase::Paused
            } else {
                PoolPhase::Running
            };
            let (tx, rx) = oneshot::channel();
            *self.inner.outcome.lock().expect("pool outcome lock") = Some(tx);
            rx
        };

        let snapshotter = self.inner.status.snapshotter().cloned();
        if let Some(snapshotter) = &snapshotter {
            snapshotter.start();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _guard = RunGuard {
            handles: vec![
                tokio::spawn(dispatch_loop(self.inner.clone(), shutdown_rx.clone())),
                tokio::spawn(autoscale_loop(self.inner.clone(), shutdown_rx)),
            ],
            shutdown_tx,
            snapshotter,
        };

        let state = self.state();
        info!(
            min = state.min_concurrency,
            max = state.max_concurrency,
            desired = state.desired_concurrency,
            "autoscaled pool started"
        );
        self.inner.maybe_run_task();

        let result = outcome_rx.await.unwrap_or(Ok(()));
        match &result {
            Ok(()) => info!(phase = ?self.state().phase, "autoscaled pool finished"),
            Err(e) => error!(error = %e, "autoscaled pool failed"),
        }
        result
    }

    /// Stop launching tasks and wait until every in-flight task settles.
    ///
    /// Pausing a pool that has not been run yet makes `run()` start paused.
    pub async fn pause(&self) {
        self.inner.set_paused();
        self.inner.wait_for_drain().await;
    }

    /// Like `pause`, but gives up waiting after `after`.
    ///
    /// The pool stays paused either way.
    pub async fn pause_with_timeout(&self, after: Duration) -> PoolResult<()> {
        self.inner.set_paused();
        tokio::time::timeout(after, self.inner.wait_for_drain())
            .await
            .map_err(|_| PoolError::DrainTimeout { after })
    }

    /// Resume launching tasks after `pause`.
    pub fn resume(&self) {
        {
            let mut shared = self.inner.lock_shared();
            if shared.phase == PoolPhase::Created {
                shared.start_paused = false;
                return;
            }
            if shared.phase != PoolPhase::Paused {
                return;
            }
            shared.phase = PoolPhase::Running;
        }
        info!("autoscaled pool resumed");
        self.inner.maybe_run_task();
    }

    /// Resolve `run()` successfully right away.
    ///
    /// No new tasks are launched and `is_finished` is not consulted again.
    /// In-flight tasks are left to finish on their own.
    pub fn abort(&self) {
        {
            let mut shared = self.inner.lock_shared();
            if shared.phase.is_terminal() {
                return;
            }
            shared.phase = PoolPhase::Aborted;
        }
        info!("autoscaled pool aborted");
        self.inner.resolve(Ok(()));
    }

    /// Try to launch a task now instead of waiting for the next tick.
    pub fn notify(&self) {
        self.inner.maybe_run_task();
    }

    pub fn state(&self) -> PoolState {
        let shared = self.inner.lock_shared();
        PoolState {
            phase: shared.phase,
            min_concurrency: shared.min_concurrency,
            max_concurrency: shared.max_concurrency,
            desired_concurrency: shared.desired_concurrency,
            current_concurrency: shared.current_concurrency,
        }
    }

    pub fn current_concurrency(&self) -> usize {
        self.inner.lock_shared().current_concurrency
    }

    pub fn desired_concurrency(&self) -> usize {
        self.inner.lock_shared().desired_concurrency
    }

    pub fn min_concurrency(&self) -> usize {
        self.inner.lock_shared().min_concurrency
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.lock_shared().max_concurrency
    }

    pub fn set_min_concurrency(&self, value: usize) -> PoolResult<()> {
        let mut shared = self.inner.lock_shared();
        if value < 1 {
            return Err(ConfigError::invalid("min_concurrency", "must be at least 1").into());
        }
        if value > shared.max_concurrency {
            return Err(ConfigError::invalid(
                "min_concurrency",
                format!("{value} exceeds max_concurrency {}", shared.max_concurrency),
            )
            .into());
        }
        shared.min_concurrency = value;
        shared.clamp_desired();
        drop(shared);
        self.inner.maybe_run_task();
        Ok(())
    }

    pub fn set_max_concurrency(&self, value: usize) -> PoolResult<()> {
        let mut shared = self.inner.lock_shared();
        if value < shared.min_concurrency {
            return Err(ConfigError::invalid(
                "max_concurrency",
                format!("{value} is below min_concurrency {}", shared.min_concurrency),
            )
            .into());
        }
        shared.max_concurrency = value;
        shared.clamp_desired();
        drop(shared);
        self.inner.maybe_run_task();
        Ok(())
    }

    /// Set the desired concurrency, clamped into `[min, max]`.
    pub fn set_desired_concurrency(&self, value: usize) {
        {
            let mut shared = self.inner.lock_shared();
            shared.desired_concurrency = value;
            shared.clamp_desired();
        }
        self.inner.maybe_run_task();
    }
}

impl Shared {
    fn clamp_desired(&mut self) {
        self.desired_concurrency = self
            .desired_concurrency
            .clamp(self.min_concurrency, self.max_concurrency);
    }
}

impl PoolInner {
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("pool state lock")
    }

    fn resolve(&self, result: PoolResult<()>) {
        if let Some(tx) = self.outcome.lock().expect("pool outcome lock").take() {
            let _ = tx.send(result);
        }
    }

    fn fail(&self, error: PoolError) {
        {
            let mut shared = self.lock_shared();
            if shared.phase.is_terminal() {
                debug!(error = %error, "ignoring error after pool stopped");
                return;
            }
            shared.phase = PoolPhase::Failed;
        }
        self.resolve(Err(error));
    }

    fn set_paused(&self) {
        let mut shared = self.lock_shared();
        if shared.phase == PoolPhase::Created {
            shared.start_paused = true;
        } else if shared.phase == PoolPhase::Running {
            shared.phase = PoolPhase::Paused;
            info!(
                in_flight = shared.current_concurrency,
                "autoscaled pool paused"
            );
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.drained.notified();
            if self.lock_shared().current_concurrency == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Whether another task start would exceed `max_tasks_per_minute`.
    fn is_over_task_rate(&self, shared: &mut Shared, now: Instant) -> bool {
        let Some(limit) = self.config.max_tasks_per_minute else {
            return false;
        };
        while let Some(oldest) = shared.task_starts.front() {
            if now.saturating_duration_since(*oldest) >= TASK_RATE_WINDOW {
                shared.task_starts.pop_front();
            } else {
                break;
            }
        }
        shared.task_starts.len() >= limit as usize
    }

    /// Ask `is_task_ready` and launch a task if there is room for one.
    fn maybe_run_task(self: &Arc<Self>) {
        {
            let mut shared = self.lock_shared();
            if shared.phase != PoolPhase::Running
                || shared.querying_ready
                || shared.current_concurrency >= shared.desired_concurrency
            {
                return;
            }
            if self.is_over_task_rate(&mut shared, Instant::now()) {
                debug!("max tasks per minute reached");
                return;
            }
            shared.querying_ready = true;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.query_and_launch().await });
    }

    async fn query_and_launch(self: Arc<Self>) {
        let ready = call_predicate(&self.is_task_ready, "is_task_ready").await;

        let launched = {
            let mut shared = self.lock_shared();
            shared.querying_ready = false;
            match ready {
                Err(e) => {
                    drop(shared);
                    self.fail(e);
                    return;
                }
                Ok(false) => false,
                Ok(true) => {
                    if shared.phase == PoolPhase::Running
                        && shared.current_concurrency < shared.desired_concurrency
                    {
                        shared.current_concurrency += 1;
                        if self.config.max_tasks_per_minute.is_some() {
                            shared.task_starts.push_back(Instant::now());
                        }
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if !launched {
            self.maybe_finish();
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.run_one_task().await });
        self.maybe_run_task();
    }

    async fn run_one_task(self: Arc<Self>) {
        // The body runs as its own task so a timeout only abandons the wait.
        let body = tokio::spawn((self.run_task)());

        let result = match self.config.task_timeout() {
            Some(after) => match tokio::time::timeout(after, body).await {
                Ok(joined) => flatten_task(joined),
                Err(_) => Err(PoolError::Timeout { after }),
            },
            None => flatten_task(body.await),
        };

        let drained = {
            let mut shared = self.lock_shared();
            shared.current_concurrency = shared.current_concurrency.saturating_sub(1);
            shared.current_concurrency == 0
        };
        if drained {
            self.drained.notify_waiters();
        }

        match result {
            Ok(()) => {
                self.maybe_run_task();
                self.maybe_finish();
            }
            Err(e) => self.fail(e),
        }
    }

    /// Ask `is_finished` once nothing is in flight.
    fn maybe_finish(self: &Arc<Self>) {
        {
            let mut shared = self.lock_shared();
            if shared.phase != PoolPhase::Running
                || shared.querying_finished
                || shared.current_concurrency > 0
            {
                return;
            }
            shared.querying_finished = true;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let finished = call_predicate(&inner.is_finished, "is_finished").await;
            let mut shared = inner.lock_shared();
            shared.querying_finished = false;
            match finished {
                Ok(true)
                    if shared.phase == PoolPhase::Running && shared.current_concurrency == 0 =>
                {
                    shared.phase = PoolPhase::Finished;
                    drop(shared);
                    inner.resolve(Ok(()));
                }
                Ok(_) => {}
                Err(e) => {
                    drop(shared);
                    inner.fail(e);
                }
            }
        });
    }

    /// One autoscale tick: retune the desired concurrency and emit the
    /// periodic status log.
    fn autoscale(self: &Arc<Self>) {
        let current = self.status.current_status();
        let historical = self.status.historical_status();
        let now = Instant::now();

        let scaled_up = {
            let mut shared = self.lock_shared();
            if shared.phase.is_terminal() {
                return;
            }

            let decision = scaler::evaluate(
                &ScaleInput {
                    current_concurrency: shared.current_concurrency,
                    desired_concurrency: shared.desired_concurrency,
                    min_concurrency: shared.min_concurrency,
                    max_concurrency: shared.max_concurrency,
                    idle_now: current.is_system_idle,
                    idle_lately: historical.is_system_idle,
                },
                &self.config,
            );
            shared.desired_concurrency = decision.target(shared.desired_concurrency);

            if let Some(interval) = self.config.logging_interval()
                && shared
                    .last_logged
                    .is_none_or(|last| now.saturating_duration_since(last) >= interval)
            {
                shared.last_logged = Some(now);
                info!(
                    current_concurrency = shared.current_concurrency,
                    desired_concurrency = shared.desired_concurrency,
                    is_system_idle = historical.is_system_idle,
                    memory_ratio = historical.memory.actual_ratio,
                    event_loop_ratio = historical.event_loop.actual_ratio,
                    cpu_ratio = historical.cpu.actual_ratio,
                    client_ratio = historical.client.actual_ratio,
                    "autoscaled pool status"
                );
            }

            matches!(decision, ScaleDecision::ScaleUp { .. })
        };

        if scaled_up {
            self.maybe_run_task();
        }
    }
}

/// Run a predicate as its own task so a panic surfaces as an error
/// instead of taking the caller down with it.
async fn call_predicate(predicate: &PredicateFn, name: &'static str) -> PoolResult<bool> {
    match tokio::spawn(predicate()).await {
        Ok(result) => result.map_err(|source| PoolError::Predicate {
            predicate: name,
            source,
        }),
        Err(e) => Err(PoolError::Predicate {
            predicate: name,
            source: anyhow::anyhow!("{name} panicked: {e}"),
        }),
    }
}

fn flatten_task(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> PoolResult<()> {
    match joined {
        Ok(result) => result.map_err(PoolError::Task),
        Err(e) => Err(PoolError::Task(anyhow::anyhow!("task panicked: {e}"))),
    }
}

async fn dispatch_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.config.maybe_run_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.maybe_run_task(),
            _ = shutdown.changed() => break,
        }
    }
}

async fn autoscale_loop(inner: Arc<PoolInner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.autoscale_interval();
    let start = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => inner.autoscale(),
            _ = shutdown.changed() => break,
        }
    }
}
