//! crawlgrid-snapshot — resource sampling for the autoscaled pool.
//!
//! The `Snapshotter` keeps one bounded, time-ordered window of samples per
//! resource. Each sample carries an `is_overloaded` flag that the system
//! status layer aggregates into idle/overloaded verdicts.
//!
//! # Architecture
//!
//! ```text
//! Snapshotter
//!   ├── event-loop task  → EventLoopSnapshot (timer scheduling delay)
//!   ├── client task      → ClientSnapshot    (RateLimitErrorSource)
//!   ├── system-info task → MemorySnapshot    (MemoryInfoProvider)
//!   │                    → CpuSnapshot       (CpuInfoProvider tick deltas)
//!   └── or, when a SystemInfo receiver is configured,
//!       pushed events    → MemorySnapshot + CpuSnapshot
//! ```
//!
//! Every insertion prunes samples older than `snapshot_history_secs`.
//! A failed probe is logged and skipped; sampling never stops on error.

pub mod os;
pub mod provider;
pub mod snapshot;
pub mod snapshotter;

pub use os::OsProbe;
pub use provider::{
    CpuInfoProvider, CpuTicks, MemoryInfo, MemoryInfoProvider, RateLimitErrorSource,
    SamplingError, SystemInfo,
};
pub use snapshot::{
    ClientSnapshot, CpuSnapshot, EventLoopSnapshot, MemorySnapshot, Sample, SampleWindow,
};
pub use snapshotter::{Snapshotter, SnapshotterBuilder};
