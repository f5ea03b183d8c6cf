//! crawlgrid-autoscale — the autoscaled task pool.
//!
//! `AutoscaledPool` runs an open-ended stream of tasks supplied through
//! three callbacks (`run_task`, `is_task_ready`, `is_finished`). Two
//! periodic activities drive it:
//!
//! - the dispatch loop launches tasks while
//!   `current_concurrency < desired_concurrency`, and also runs right
//!   after every task settles;
//! - the autoscale tick retunes `desired_concurrency` from the
//!   `SystemStatusSource` verdicts.
//!
//! # Scaling Algorithm
//!
//! ```text
//! busy_enough = current >= floor(desired * desired_concurrency_ratio)
//!
//! if busy_enough and idle_now and idle_lately:
//!     desired += ceil(desired * scale_up_step_ratio)    // capped at max
//! elif not idle_lately:
//!     desired -= ceil(desired * scale_down_step_ratio)  // floored at min
//! ```
//!
//! Any callback error or task timeout fails the whole `run()`; retries are
//! the caller's business. `abort()` resolves `run()` at once without
//! waiting for in-flight tasks, which keep running detached.

pub mod error;
pub mod pool;
pub mod scaler;

pub use error::{PoolError, PoolResult};
pub use pool::{AutoscaledPool, AutoscaledPoolBuilder, PoolPhase, PoolState, PredicateFn, RunTaskFn};
pub use scaler::{ScaleDecision, ScaleInput};
