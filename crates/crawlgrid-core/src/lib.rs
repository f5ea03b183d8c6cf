//! crawlgrid-core — shared configuration for the CrawlGrid scheduler.
//!
//! Every section of `crawlgrid.toml` is optional; missing keys fall back
//! to the defaults documented on each field.
//!
//! ```toml
//! [pool]
//! min_concurrency = 1
//! max_concurrency = 50
//! task_timeout_secs = 30
//!
//! [system_status]
//! current_history_secs = 5
//!
//! [snapshotter]
//! max_used_memory_ratio = 0.9
//! ```

pub mod config;
pub mod error;

pub use config::{CrawlGridConfig, PoolConfig, SnapshotterConfig, SystemStatusConfig};
pub use error::{ConfigError, ConfigResult};
