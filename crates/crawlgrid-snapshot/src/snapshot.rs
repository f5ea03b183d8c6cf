//! Snapshot types and the bounded per-resource sample window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Common view over every snapshot type.
pub trait Sample: Clone {
    fn created_at(&self) -> Instant;
    fn is_overloaded(&self) -> bool;
}

/// Memory usage of this process and its children.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub used_bytes: u64,
}

/// CPU utilisation since the previous sample.
///
/// `used_ratio` is `None` for samples pushed from an external system-info
/// source that only reports the overload flag.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub used_ratio: Option<f64>,
}

/// Scheduling delay of the event-loop timer.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLoopSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    /// How far the delay exceeded `max_blocked_millis`.
    pub exceeded_millis: u64,
}

/// Rate-limit errors reported by the API client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub created_at: Instant,
    pub is_overloaded: bool,
    pub rate_limit_error_count: u64,
}

macro_rules! impl_sample {
    ($($ty:ty),*) => {
        $(
            impl Sample for $ty {
                fn created_at(&self) -> Instant {
                    self.created_at
                }

                fn is_overloaded(&self) -> bool {
                    self.is_overloaded
                }
            }
        )*
    };
}

impl_sample!(MemorySnapshot, CpuSnapshot, EventLoopSnapshot, ClientSnapshot);

/// Time-ordered samples of one resource, bounded by a retention duration.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    samples: VecDeque<T>,
    retention: Duration,
}

impl<T: Sample> SampleWindow<T> {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    /// Append a sample, evicting everything older than the retention
    /// relative to the new sample.
    ///
    /// Returns `false` and drops the sample if it predates the newest one.
    pub fn push(&mut self, sample: T) -> bool {
        if let Some(latest) = self.samples.back()
            && sample.created_at() < latest.created_at()
        {
            return false;
        }
        self.prune(sample.created_at());
        self.samples.push_back(sample);
        true
    }

    /// Drop samples older than `now - retention`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.saturating_duration_since(oldest.created_at()) > self.retention {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    /// Samples no older than `max_age` measured from the latest sample,
    /// not from the wall clock. `None` returns the whole window.
    pub fn sample(&self, max_age: Option<Duration>) -> Vec<T> {
        let Some(max_age) = max_age else {
            return self.samples.iter().cloned().collect();
        };
        let Some(latest) = self.samples.back().map(Sample::created_at) else {
            return Vec::new();
        };

        let start = self
            .samples
            .iter()
            .rposition(|s| latest.saturating_duration_since(s.created_at()) > max_age)
            .map_or(0, |idx| idx + 1);
        self.samples.range(start..).cloned().collect()
    }
}
