//! Idle/overloaded verdicts derived from snapshot windows.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crawlgrid_core::{ConfigResult, SystemStatusConfig};
use crawlgrid_snapshot::{Sample, Snapshotter};

/// Overload verdict for one resource over one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceLoad {
    pub is_overloaded: bool,
    pub limit_ratio: f64,
    pub actual_ratio: f64,
}

impl ResourceLoad {
    /// Fraction of overloaded samples compared against `limit_ratio`.
    pub fn from_samples<T: Sample>(samples: &[T], limit_ratio: f64) -> Self {
        if samples.is_empty() {
            return Self {
                is_overloaded: false,
                limit_ratio,
                actual_ratio: 0.0,
            };
        }
        let overloaded = samples.iter().filter(|s| s.is_overloaded()).count();
        let actual_ratio = overloaded as f64 / samples.len() as f64;
        Self {
            is_overloaded: actual_ratio > limit_ratio,
            limit_ratio,
            actual_ratio,
        }
    }
}

/// Per-resource verdicts and the combined idle flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemStatusReport {
    pub is_system_idle: bool,
    pub memory: ResourceLoad,
    pub event_loop: ResourceLoad,
    pub cpu: ResourceLoad,
    pub client: ResourceLoad,
}

impl SystemStatusReport {
    pub fn from_loads(
        memory: ResourceLoad,
        event_loop: ResourceLoad,
        cpu: ResourceLoad,
        client: ResourceLoad,
    ) -> Self {
        let is_system_idle = !memory.is_overloaded
            && !event_loop.is_overloaded
            && !cpu.is_overloaded
            && !client.is_overloaded;
        Self {
            is_system_idle,
            memory,
            event_loop,
            cpu,
            client,
        }
    }

    /// Names of the overloaded resources, for log lines.
    pub fn overloaded_resources(&self) -> Vec<&'static str> {
        [
            ("memory", self.memory),
            ("event_loop", self.event_loop),
            ("cpu", self.cpu),
            ("client", self.client),
        ]
        .into_iter()
        .filter(|(_, load)| load.is_overloaded)
        .map(|(name, _)| name)
        .collect()
    }
}

/// Anything that can answer the two system status questions.
///
/// The pool depends on this trait rather than on `SystemStatus` so the
/// verdicts can be supplied from elsewhere.
pub trait SystemStatusSource: Send + Sync {
    /// Is the system idle right now?
    fn current_status(&self) -> SystemStatusReport;

    /// Has the system been idle over the longer recent window?
    fn historical_status(&self) -> SystemStatusReport;

    /// The snapshotter feeding this source, if it should be started and
    /// stopped together with the pool.
    fn snapshotter(&self) -> Option<&Arc<Snapshotter>> {
        None
    }
}

/// Aggregates `Snapshotter` windows into idle verdicts.
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    config: SystemStatusConfig,
}

impl SystemStatus {
    pub fn new(snapshotter: Arc<Snapshotter>, config: SystemStatusConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            snapshotter,
            config,
        })
    }

    pub fn config(&self) -> &SystemStatusConfig {
        &self.config
    }

    fn status_within(&self, window: Option<Duration>) -> SystemStatusReport {
        let snap = &self.snapshotter;
        let config = &self.config;

        let report = SystemStatusReport::from_loads(
            ResourceLoad::from_samples(
                &snap.memory_sample(window),
                config.max_memory_overloaded_ratio,
            ),
            ResourceLoad::from_samples(
                &snap.event_loop_sample(window),
                config.max_event_loop_overloaded_ratio,
            ),
            ResourceLoad::from_samples(&snap.cpu_sample(window), config.max_cpu_overloaded_ratio),
            ResourceLoad::from_samples(
                &snap.client_sample(window),
                config.max_client_overloaded_ratio,
            ),
        );

        if !report.is_system_idle {
            debug!(
                window_secs = window.map(|w| w.as_secs_f64()),
                overloaded = ?report.overloaded_resources(),
                "system not idle"
            );
        }
        report
    }
}

impl SystemStatusSource for SystemStatus {
    fn current_status(&self) -> SystemStatusReport {
        self.status_within(Some(self.config.current_history()))
    }

    fn historical_status(&self) -> SystemStatusReport {
        self.status_within(self.config.historical_history())
    }

    fn snapshotter(&self) -> Option<&Arc<Snapshotter>> {
        Some(&self.snapshotter)
    }
}
