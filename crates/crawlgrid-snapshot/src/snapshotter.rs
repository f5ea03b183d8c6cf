//! Snapshotter — periodic resource sampling with bounded history.
//!
//! Each resource gets its own background task and its own window. Reads
//! clone the window under a short read lock, so callers never block the
//! sampling tasks for long.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crawlgrid_core::{ConfigResult, SnapshotterConfig};

use crate::os::OsProbe;
use crate::provider::{
    CpuInfoProvider, CpuTicks, MemoryInfo, MemoryInfoProvider, RateLimitErrorSource,
    SamplingError, SystemInfo,
};
use crate::snapshot::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, SampleWindow,
};

/// Minimum gap between two critical memory warnings.
const CRITICAL_WARNING_INTERVAL: Duration = Duration::from_secs(10);

struct Windows {
    memory: SampleWindow<MemorySnapshot>,
    cpu: SampleWindow<CpuSnapshot>,
    event_loop: SampleWindow<EventLoopSnapshot>,
    client: SampleWindow<ClientSnapshot>,
}

#[derive(Default)]
struct ProbeState {
    /// Resolved memory budget.
    max_memory_bytes: Option<u64>,
    last_cpu_ticks: Option<CpuTicks>,
    last_critical_warning: Option<Instant>,
}

struct Inner {
    config: SnapshotterConfig,
    memory: Option<Arc<dyn MemoryInfoProvider>>,
    cpu: Option<Arc<dyn CpuInfoProvider>>,
    client: Option<Arc<dyn RateLimitErrorSource>>,
    /// Pushed system info. When present, local memory/CPU polling is off.
    system_info_rx: Option<tokio::sync::Mutex<mpsc::Receiver<SystemInfo>>>,
    windows: RwLock<Windows>,
    probe: Mutex<ProbeState>,
}

/// Background sampling tasks and their shutdown signal.
struct Workers {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Samples memory, CPU, event-loop delay, and client rate-limit errors.
pub struct Snapshotter {
    inner: Arc<Inner>,
    workers: Mutex<Option<Workers>>,
}

/// Builder for a `Snapshotter` with custom collaborators.
pub struct SnapshotterBuilder {
    config: SnapshotterConfig,
    memory: Option<Arc<dyn MemoryInfoProvider>>,
    cpu: Option<Arc<dyn CpuInfoProvider>>,
    client: Option<Arc<dyn RateLimitErrorSource>>,
    system_info_rx: Option<mpsc::Receiver<SystemInfo>>,
}

impl SnapshotterBuilder {
    pub fn memory_provider(mut self, provider: Arc<dyn MemoryInfoProvider>) -> Self {
        self.memory = Some(provider);
        self
    }

    pub fn cpu_provider(mut self, provider: Arc<dyn CpuInfoProvider>) -> Self {
        self.cpu = Some(provider);
        self
    }

    pub fn rate_limit_source(mut self, source: Arc<dyn RateLimitErrorSource>) -> Self {
        self.client = Some(source);
        self
    }

    /// Receive memory and CPU figures from an external source instead of
    /// polling the providers.
    pub fn system_info_events(mut self, rx: mpsc::Receiver<SystemInfo>) -> Self {
        self.system_info_rx = Some(rx);
        self
    }

    /// Sample memory and CPU from the local host.
    ///
    /// If the OS probe cannot be created, memory and CPU are left
    /// unsampled and only the event loop is tracked.
    pub fn os_probe(self) -> Self {
        match OsProbe::new() {
            Ok(probe) => {
                let probe = Arc::new(probe);
                self.memory_provider(probe.clone()).cpu_provider(probe)
            }
            Err(e) => {
                warn!(error = %e, "os probe unavailable, memory and cpu will not be sampled");
                self
            }
        }
    }

    pub fn build(self) -> ConfigResult<Snapshotter> {
        self.config.validate()?;
        let retention = self.config.snapshot_history();
        let probe = ProbeState {
            max_memory_bytes: self.config.max_memory_bytes,
            ..ProbeState::default()
        };

        Ok(Snapshotter {
            inner: Arc::new(Inner {
                memory: self.memory,
                cpu: self.cpu,
                client: self.client,
                system_info_rx: self.system_info_rx.map(tokio::sync::Mutex::new),
                windows: RwLock::new(Windows {
                    memory: SampleWindow::new(retention),
                    cpu: SampleWindow::new(retention),
                    event_loop: SampleWindow::new(retention),
                    client: SampleWindow::new(retention),
                }),
                probe: Mutex::new(probe),
                config: self.config,
            }),
            workers: Mutex::new(None),
        })
    }
}

impl Snapshotter {
    pub fn builder(config: SnapshotterConfig) -> SnapshotterBuilder {
        SnapshotterBuilder {
            config,
            memory: None,
            cpu: None,
            client: None,
            system_info_rx: None,
        }
    }

    /// A snapshotter probing the local host.
    pub fn with_os_probe(config: SnapshotterConfig) -> ConfigResult<Self> {
        Self::builder(config).os_probe().build()
    }

    pub fn config(&self) -> &SnapshotterConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().expect("snapshotter workers lock").is_some()
    }

    /// Start the sampling tasks. Calling `start` twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("snapshotter workers lock");
        if workers.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = &self.inner.config;
        let mut handles = Vec::new();

        handles.push(spawn_periodic(
            self.inner.clone(),
            config.event_loop_snapshot_interval(),
            shutdown_rx.clone(),
            |inner| async move {
                inner.snapshot_event_loop(Instant::now());
            },
        ));

        if self.inner.client.is_some() {
            handles.push(spawn_periodic(
                self.inner.clone(),
                config.client_snapshot_interval(),
                shutdown_rx.clone(),
                |inner| async move { inner.poll_client() },
            ));
        }

        if self.inner.system_info_rx.is_some() {
            handles.push(spawn_system_info_listener(
                self.inner.clone(),
                shutdown_rx.clone(),
            ));
        } else if self.inner.memory.is_some() || self.inner.cpu.is_some() {
            handles.push(spawn_periodic(
                self.inner.clone(),
                config.system_info_interval(),
                shutdown_rx.clone(),
                |inner| async move { inner.poll_system().await },
            ));
        }

        info!(tasks = handles.len(), "snapshotter started");
        *workers = Some(Workers {
            shutdown_tx,
            handles,
        });
    }

    /// Stop all sampling tasks. Collected samples are kept.
    pub fn stop(&self) {
        let Some(workers) = self.workers.lock().expect("snapshotter workers lock").take() else {
            return;
        };
        let _ = workers.shutdown_tx.send(true);
        for handle in workers.handles {
            handle.abort();
        }
        info!("snapshotter stopped");
    }

    pub fn memory_sample(&self, max_age: Option<Duration>) -> Vec<MemorySnapshot> {
        self.inner.read_windows().memory.sample(max_age)
    }

    pub fn cpu_sample(&self, max_age: Option<Duration>) -> Vec<CpuSnapshot> {
        self.inner.read_windows().cpu.sample(max_age)
    }

    pub fn event_loop_sample(&self, max_age: Option<Duration>) -> Vec<EventLoopSnapshot> {
        self.inner.read_windows().event_loop.sample(max_age)
    }

    pub fn client_sample(&self, max_age: Option<Duration>) -> Vec<ClientSnapshot> {
        self.inner.read_windows().client.sample(max_age)
    }

    /// Feed externally computed figures, as if pushed by an event source.
    pub fn ingest_system_info(&self, info: SystemInfo) {
        self.inner.ingest_system_info(info);
    }

    /// Record a memory sample from already-collected figures.
    pub fn record_memory(&self, info: MemoryInfo, now: Instant) -> Option<MemorySnapshot> {
        match self.inner.record_memory(info, now) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "memory sample skipped");
                None
            }
        }
    }

    /// Record CPU tick counters. The first reading only sets the baseline.
    pub fn record_cpu_ticks(&self, ticks: CpuTicks, now: Instant) -> Option<CpuSnapshot> {
        self.inner.record_cpu_ticks(ticks, now)
    }

    /// Record an event-loop tick that fired at `now`.
    pub fn record_event_loop_tick(&self, now: Instant) -> EventLoopSnapshot {
        self.inner.snapshot_event_loop(now)
    }

    /// Record the client's recent rate-limit error counts.
    pub fn record_client_errors(&self, errors: &[u64], now: Instant) -> ClientSnapshot {
        self.inner.record_client(errors, now)
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.workers.lock()
            && let Some(workers) = guard.take()
        {
            let _ = workers.shutdown_tx.send(true);
            for handle in workers.handles {
                handle.abort();
            }
        }
    }
}

impl Inner {
    fn read_windows(&self) -> std::sync::RwLockReadGuard<'_, Windows> {
        self.windows.read().expect("snapshot windows lock")
    }

    fn write_windows(&self) -> std::sync::RwLockWriteGuard<'_, Windows> {
        self.windows.write().expect("snapshot windows lock")
    }

    fn snapshot_event_loop(&self, now: Instant) -> EventLoopSnapshot {
        let interval = self.config.event_loop_snapshot_interval();
        let max_blocked = self.config.max_blocked();
        let mut windows = self.write_windows();

        let mut snapshot = EventLoopSnapshot {
            created_at: now,
            is_overloaded: false,
            exceeded_millis: 0,
        };
        if let Some(previous) = windows.event_loop.latest() {
            let delay = now
                .saturating_duration_since(previous.created_at)
                .saturating_sub(interval);
            snapshot.is_overloaded = delay > max_blocked;
            snapshot.exceeded_millis = delay.saturating_sub(max_blocked).as_millis() as u64;
        }

        if snapshot.is_overloaded {
            debug!(
                exceeded_millis = snapshot.exceeded_millis,
                "event loop overloaded"
            );
        }
        windows.event_loop.push(snapshot.clone());
        snapshot
    }

    fn poll_client(&self) {
        if let Some(client) = &self.client {
            let errors = client.rate_limit_errors();
            self.record_client(&errors, Instant::now());
        }
    }

    fn record_client(&self, errors: &[u64], now: Instant) -> ClientSnapshot {
        let count = errors.iter().fold(0u64, |acc, n| acc.saturating_add(*n));
        let snapshot = ClientSnapshot {
            created_at: now,
            is_overloaded: count > self.config.max_client_errors,
            rate_limit_error_count: count,
        };
        if snapshot.is_overloaded {
            debug!(
                rate_limit_errors = count,
                max = self.config.max_client_errors,
                "client overloaded"
            );
        }
        self.write_windows().client.push(snapshot.clone());
        snapshot
    }

    /// Poll the memory and CPU providers off the runtime threads.
    async fn poll_system(self: Arc<Self>) {
        if let Some(provider) = self.memory.clone() {
            match tokio::task::spawn_blocking(move || provider.memory_info()).await {
                Ok(Ok(info)) => {
                    if let Err(e) = self.record_memory(info, Instant::now()) {
                        warn!(error = %e, "memory sample skipped");
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "memory sample skipped"),
                Err(e) => warn!(error = %e, "memory probe task failed"),
            }
        }

        if let Some(provider) = self.cpu.clone() {
            match tokio::task::spawn_blocking(move || provider.cpu_ticks()).await {
                Ok(Ok(ticks)) => {
                    self.record_cpu_ticks(ticks, Instant::now());
                }
                Ok(Err(e)) => warn!(error = %e, "cpu sample skipped"),
                Err(e) => warn!(error = %e, "cpu probe task failed"),
            }
        }
    }

    fn max_memory_bytes(&self, total_bytes: Option<u64>) -> Result<u64, SamplingError> {
        let mut probe = self.probe.lock().expect("snapshot probe lock");
        if let Some(max) = probe.max_memory_bytes {
            return Ok(max);
        }
        let total = total_bytes
            .filter(|t| *t > 0)
            .ok_or_else(|| SamplingError::Memory("total memory unknown".to_string()))?;
        let max = ((total as f64) * self.config.available_memory_ratio) as u64;
        let max = max.max(1);
        info!(
            max_memory_mb = max / (1024 * 1024),
            "memory budget derived from total memory"
        );
        probe.max_memory_bytes = Some(max);
        Ok(max)
    }

    fn record_memory(
        &self,
        info: MemoryInfo,
        now: Instant,
    ) -> Result<MemorySnapshot, SamplingError> {
        self.record_used_memory(info.used_bytes(), Some(info.total_bytes), now)
    }

    fn record_used_memory(
        &self,
        used_bytes: u64,
        total_bytes: Option<u64>,
        now: Instant,
    ) -> Result<MemorySnapshot, SamplingError> {
        let max_bytes = self.max_memory_bytes(total_bytes)?;
        let used_ratio = used_bytes as f64 / max_bytes as f64;

        let snapshot = MemorySnapshot {
            created_at: now,
            is_overloaded: used_ratio > self.config.max_used_memory_ratio,
            used_bytes,
        };
        self.warn_on_critical_memory(used_bytes, max_bytes, now);
        self.write_windows().memory.push(snapshot.clone());
        Ok(snapshot)
    }

    fn warn_on_critical_memory(&self, used_bytes: u64, max_bytes: u64, now: Instant) {
        let used_ratio = used_bytes as f64 / max_bytes as f64;
        if used_ratio <= self.config.critical_memory_ratio {
            return;
        }

        let mut probe = self.probe.lock().expect("snapshot probe lock");
        if let Some(last) = probe.last_critical_warning
            && now.saturating_duration_since(last) < CRITICAL_WARNING_INTERVAL
        {
            return;
        }
        probe.last_critical_warning = Some(now);

        warn!(
            used_mb = used_bytes / (1024 * 1024),
            max_mb = max_bytes / (1024 * 1024),
            used_percent = (used_ratio * 100.0).round() as u64,
            "memory is critically overloaded, consider raising the memory budget"
        );
    }

    fn record_cpu_ticks(&self, ticks: CpuTicks, now: Instant) -> Option<CpuSnapshot> {
        let previous = self
            .probe
            .lock()
            .expect("snapshot probe lock")
            .last_cpu_ticks
            .replace(ticks)?;

        let used_ratio = ticks.used_ratio_since(&previous).unwrap_or(0.0);
        let snapshot = CpuSnapshot {
            created_at: now,
            is_overloaded: used_ratio > self.config.max_used_cpu_ratio,
            used_ratio: Some(used_ratio),
        };
        self.write_windows().cpu.push(snapshot.clone());
        Some(snapshot)
    }

    fn ingest_system_info(&self, info: SystemInfo) {
        if let Err(e) =
            self.record_used_memory(info.mem_current_bytes, info.mem_total_bytes, info.created_at)
        {
            warn!(error = %e, "memory sample skipped");
        }

        let snapshot = CpuSnapshot {
            created_at: info.created_at,
            is_overloaded: info.is_cpu_overloaded,
            used_ratio: None,
        };
        if !self.write_windows().cpu.push(snapshot) {
            debug!("stale system info ignored for cpu window");
        }
    }
}

/// Run `tick` every `period` until shutdown.
fn spawn_periodic<F, Fut>(
    inner: Arc<Inner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick(inner.clone()).await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_system_info_listener(
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(rx) = &inner.system_info_rx else {
            return;
        };
        let mut rx = rx.lock().await;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(info) => inner.ingest_system_info(info),
                    None => {
                        debug!("system info source closed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}
