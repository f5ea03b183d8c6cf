//! crawlgrid-status — system health verdicts for the autoscaled pool.
//!
//! `SystemStatus` reads the snapshotter's windows and reports whether the
//! system is idle, i.e. no resource has more overloaded samples than its
//! configured ratio allows.
//!
//! ```text
//! current_status()    → samples within current_history_secs of the latest
//! historical_status() → samples within historical_history_secs (or all)
//!
//! overloaded_ratio = overloaded samples / samples
//! resource overloaded iff overloaded_ratio > max_<resource>_overloaded_ratio
//! is_system_idle      = no resource overloaded
//! ```
//!
//! An empty window counts as not overloaded.

pub mod status;

pub use status::{ResourceLoad, SystemStatus, SystemStatusReport, SystemStatusSource};
