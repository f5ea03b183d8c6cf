//! Collaborator interfaces consumed by the snapshotter.
//!
//! The snapshotter never talks to the OS or an API client directly; it
//! reads these traits, so tests and embedders can substitute their own
//! figures.

use thiserror::Error;
use tokio::time::Instant;

/// A single failed probe. Logged and skipped by the snapshotter.
#[derive(Debug, Error)]
pub enum SamplingError {
    #[error("memory probe failed: {0}")]
    Memory(String),

    #[error("cpu probe failed: {0}")]
    Cpu(String),

    #[error("probe unsupported on this platform: {0}")]
    Unsupported(String),
}

/// Resident memory figures, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryInfo {
    pub main_process_bytes: u64,
    pub child_processes_bytes: u64,
    /// Total physical memory of the host.
    pub total_bytes: u64,
}

impl MemoryInfo {
    pub fn used_bytes(&self) -> u64 {
        self.main_process_bytes
            .saturating_add(self.child_processes_bytes)
    }
}

/// Cumulative CPU tick counters, summed across cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTicks {
    pub idle: u64,
    pub total: u64,
}

impl CpuTicks {
    /// Busy ratio between `previous` and `self`, or `None` if no ticks
    /// elapsed.
    pub fn used_ratio_since(&self, previous: &CpuTicks) -> Option<f64> {
        let total = self.total.saturating_sub(previous.total);
        if total == 0 {
            return None;
        }
        let idle = self.idle.saturating_sub(previous.idle).min(total);
        Some(1.0 - idle as f64 / total as f64)
    }
}

/// Externally computed system figures pushed into the snapshotter.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    pub created_at: Instant,
    pub mem_current_bytes: u64,
    /// Host memory, used to derive the budget when none is configured.
    pub mem_total_bytes: Option<u64>,
    pub is_cpu_overloaded: bool,
}

pub trait MemoryInfoProvider: Send + Sync {
    fn memory_info(&self) -> Result<MemoryInfo, SamplingError>;
}

pub trait CpuInfoProvider: Send + Sync {
    fn cpu_ticks(&self) -> Result<CpuTicks, SamplingError>;
}

/// An API client that tracks how many requests were rate limited.
pub trait RateLimitErrorSource: Send + Sync {
    /// Error counts over the client's recent window.
    fn rate_limit_errors(&self) -> Vec<u64>;
}

impl<F> RateLimitErrorSource for F
where
    F: Fn() -> Vec<u64> + Send + Sync,
{
    fn rate_limit_errors(&self) -> Vec<u64> {
        self()
    }
}
