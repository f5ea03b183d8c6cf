//! crawlgrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlGridConfig {
    pub pool: PoolConfig,
    pub system_status: SystemStatusConfig,
    pub snapshotter: SnapshotterConfig,
}

/// Autoscaled pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Lower bound for the desired concurrency.
    pub min_concurrency: usize,
    /// Upper bound for the desired concurrency.
    pub max_concurrency: usize,
    /// Starting desired concurrency. Defaults to `min_concurrency`.
    pub desired_concurrency: Option<usize>,
    /// Fraction of the desired concurrency that must be in flight before
    /// the pool considers scaling up.
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Period of the dispatch loop.
    pub maybe_run_interval_secs: f64,
    /// Period of the autoscale tick.
    pub autoscale_interval_secs: f64,
    /// Period of the status summary log. `None` or `0` disables it.
    pub logging_interval_secs: Option<f64>,
    /// Per-task timeout. `0` means unlimited.
    pub task_timeout_secs: f64,
    /// Cap on task starts within any 60 second window.
    pub max_tasks_per_minute: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.95,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval_secs: 0.5,
            autoscale_interval_secs: 10.0,
            logging_interval_secs: Some(60.0),
            task_timeout_secs: 0.0,
            max_tasks_per_minute: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_concurrency < 1 {
            return Err(ConfigError::invalid("min_concurrency", "must be at least 1"));
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(ConfigError::invalid(
                "max_concurrency",
                format!(
                    "{} is below min_concurrency {}",
                    self.max_concurrency, self.min_concurrency
                ),
            ));
        }
        if let Some(desired) = self.desired_concurrency
            && !(self.min_concurrency..=self.max_concurrency).contains(&desired)
        {
            return Err(ConfigError::invalid(
                "desired_concurrency",
                format!(
                    "{desired} is outside [{}, {}]",
                    self.min_concurrency, self.max_concurrency
                ),
            ));
        }
        check_ratio("desired_concurrency_ratio", self.desired_concurrency_ratio)?;
        check_ratio("scale_up_step_ratio", self.scale_up_step_ratio)?;
        check_ratio("scale_down_step_ratio", self.scale_down_step_ratio)?;
        check_interval("maybe_run_interval_secs", self.maybe_run_interval_secs)?;
        check_interval("autoscale_interval_secs", self.autoscale_interval_secs)?;
        if let Some(secs) = self.logging_interval_secs
            && secs != 0.0
        {
            check_interval("logging_interval_secs", secs)?;
        }
        if self.task_timeout_secs < 0.0
            || Duration::try_from_secs_f64(self.task_timeout_secs).is_err()
        {
            return Err(ConfigError::invalid(
                "task_timeout_secs",
                "must be a non-negative, representable number of seconds",
            ));
        }
        if self.max_tasks_per_minute == Some(0) {
            return Err(ConfigError::invalid("max_tasks_per_minute", "must be at least 1 when set"));
        }
        Ok(())
    }

    /// The starting desired concurrency.
    pub fn initial_desired_concurrency(&self) -> usize {
        self.desired_concurrency.unwrap_or(self.min_concurrency)
    }

    pub fn maybe_run_interval(&self) -> Duration {
        Duration::from_secs_f64(self.maybe_run_interval_secs)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs_f64(self.autoscale_interval_secs)
    }

    pub fn logging_interval(&self) -> Option<Duration> {
        self.logging_interval_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0.0).then(|| Duration::from_secs_f64(self.task_timeout_secs))
    }
}

/// Overload thresholds used when deriving system status verdicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStatusConfig {
    /// Window used by the "current" verdict.
    pub current_history_secs: f64,
    /// Window used by the "historical" verdict. `None` uses every
    /// retained sample.
    pub historical_history_secs: Option<f64>,
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            current_history_secs: 5.0,
            historical_history_secs: None,
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.6,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.3,
        }
    }
}

impl SystemStatusConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_interval("current_history_secs", self.current_history_secs)?;
        if let Some(secs) = self.historical_history_secs {
            check_interval("historical_history_secs", secs)?;
        }
        check_ratio("max_memory_overloaded_ratio", self.max_memory_overloaded_ratio)?;
        check_ratio(
            "max_event_loop_overloaded_ratio",
            self.max_event_loop_overloaded_ratio,
        )?;
        check_ratio("max_cpu_overloaded_ratio", self.max_cpu_overloaded_ratio)?;
        check_ratio("max_client_overloaded_ratio", self.max_client_overloaded_ratio)?;
        Ok(())
    }

    pub fn current_history(&self) -> Duration {
        Duration::from_secs_f64(self.current_history_secs)
    }

    pub fn historical_history(&self) -> Option<Duration> {
        self.historical_history_secs.map(Duration::from_secs_f64)
    }
}

/// Sampling cadence and per-resource overload limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    pub event_loop_snapshot_interval_secs: f64,
    pub client_snapshot_interval_secs: f64,
    /// Period of the local memory and CPU probes.
    pub system_info_interval_secs: f64,
    /// Scheduling delay above which an event-loop sample is overloaded.
    pub max_blocked_millis: u64,
    pub max_used_memory_ratio: f64,
    /// Usage ratio above which a critical memory warning is logged.
    pub critical_memory_ratio: f64,
    pub max_used_cpu_ratio: f64,
    /// Recent rate-limit errors above which a client sample is overloaded.
    pub max_client_errors: u64,
    /// Retention for every sample window.
    pub snapshot_history_secs: f64,
    /// Memory budget. Derived from total memory when unset.
    pub max_memory_bytes: Option<u64>,
    /// Share of total memory used as the budget when `max_memory_bytes`
    /// is unset.
    pub available_memory_ratio: f64,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            event_loop_snapshot_interval_secs: 0.5,
            client_snapshot_interval_secs: 1.0,
            system_info_interval_secs: 1.0,
            max_blocked_millis: 50,
            max_used_memory_ratio: 0.9,
            critical_memory_ratio: 0.95,
            max_used_cpu_ratio: 0.95,
            max_client_errors: 3,
            snapshot_history_secs: 30.0,
            max_memory_bytes: None,
            available_memory_ratio: 0.25,
        }
    }
}

impl SnapshotterConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_interval(
            "event_loop_snapshot_interval_secs",
            self.event_loop_snapshot_interval_secs,
        )?;
        check_interval(
            "client_snapshot_interval_secs",
            self.client_snapshot_interval_secs,
        )?;
        check_interval("system_info_interval_secs", self.system_info_interval_secs)?;
        check_interval("snapshot_history_secs", self.snapshot_history_secs)?;
        check_ratio("max_used_memory_ratio", self.max_used_memory_ratio)?;
        check_ratio("max_used_cpu_ratio", self.max_used_cpu_ratio)?;
        check_ratio("available_memory_ratio", self.available_memory_ratio)?;
        if !self.critical_memory_ratio.is_finite()
            || self.critical_memory_ratio < self.max_used_memory_ratio
        {
            return Err(ConfigError::invalid(
                "critical_memory_ratio",
                format!(
                    "must not be below max_used_memory_ratio {}",
                    self.max_used_memory_ratio
                ),
            ));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(ConfigError::invalid("max_memory_bytes", "must be positive when set"));
        }
        Ok(())
    }

    pub fn event_loop_snapshot_interval(&self) -> Duration {
        Duration::from_secs_f64(self.event_loop_snapshot_interval_secs)
    }

    pub fn client_snapshot_interval(&self) -> Duration {
        Duration::from_secs_f64(self.client_snapshot_interval_secs)
    }

    pub fn system_info_interval(&self) -> Duration {
        Duration::from_secs_f64(self.system_info_interval_secs)
    }

    pub fn snapshot_history(&self) -> Duration {
        Duration::from_secs_f64(self.snapshot_history_secs)
    }

    pub fn max_blocked(&self) -> Duration {
        Duration::from_millis(self.max_blocked_millis)
    }
}

impl CrawlGridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: CrawlGridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.system_status.validate()?;
        self.snapshotter.validate()
    }
}

fn check_ratio(field: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} is outside (0, 1]")))
    }
}

fn check_interval(field: &'static str, secs: f64) -> ConfigResult<()> {
    if secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok() {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("{secs} is not a positive, representable number of seconds"),
        ))
    }
}
