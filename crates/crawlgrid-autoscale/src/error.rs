//! Autoscaled pool error types.

use std::time::Duration;

use thiserror::Error;

use crawlgrid_core::ConfigError;

/// Errors that end or reject pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("task failed: {0}")]
    Task(#[source] anyhow::Error),

    #[error("{predicate} failed: {source}")]
    Predicate {
        predicate: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("task timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("pool has already been started")]
    AlreadyStarted,

    #[error("running tasks did not finish within {after:?}")]
    DrainTimeout { after: Duration },
}

pub type PoolResult<T> = Result<T, PoolError>;
