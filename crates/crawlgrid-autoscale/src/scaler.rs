//! Scale decision — one autoscale step for the pool.
//!
//! Pure function of the pool's concurrency figures and the two status
//! verdicts, so the pool only has to apply the result.

use tracing::debug;

use crawlgrid_core::PoolConfig;

/// A change to the desired concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp { from: usize, to: usize },
    ScaleDown { from: usize, to: usize },
    /// No change needed.
    NoChange,
}

impl ScaleDecision {
    /// The desired concurrency after applying this decision.
    pub fn target(&self, desired: usize) -> usize {
        match *self {
            ScaleDecision::ScaleUp { to, .. } | ScaleDecision::ScaleDown { to, .. } => to,
            ScaleDecision::NoChange => desired,
        }
    }
}

/// Inputs to one autoscale step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleInput {
    pub current_concurrency: usize,
    pub desired_concurrency: usize,
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// `current_status().is_system_idle`
    pub idle_now: bool,
    /// `historical_status().is_system_idle`
    pub idle_lately: bool,
}

/// Decide how the desired concurrency should move.
pub fn evaluate(input: &ScaleInput, config: &PoolConfig) -> ScaleDecision {
    let desired = input.desired_concurrency;
    let min_busy = (desired as f64 * config.desired_concurrency_ratio).floor() as usize;
    let busy_enough = input.current_concurrency >= min_busy;

    if busy_enough && input.idle_now && input.idle_lately {
        let step = (desired as f64 * config.scale_up_step_ratio).ceil() as usize;
        let to = desired.saturating_add(step).min(input.max_concurrency);
        if to > desired {
            debug!(
                from = desired,
                to,
                current = input.current_concurrency,
                "scaling up"
            );
            return ScaleDecision::ScaleUp { from: desired, to };
        }
        return ScaleDecision::NoChange;
    }

    if !input.idle_lately {
        let step = (desired as f64 * config.scale_down_step_ratio).ceil() as usize;
        let to = desired.saturating_sub(step).max(input.min_concurrency);
        if to < desired {
            debug!(
                from = desired,
                to,
                current = input.current_concurrency,
                "scaling down"
            );
            return ScaleDecision::ScaleDown { from: desired, to };
        }
    }

    ScaleDecision::NoChange
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(current: usize, desired: usize, idle_now: bool, idle_lately: bool) -> ScaleInput {
        ScaleInput {
            current_concurrency: current,
            desired_concurrency: desired,
            min_concurrency: 1,
            max_concurrency: 50,
            idle_now,
            idle_lately,
        }
    }

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    #[test]
    fn scale_up_when_busy_and_idle() {
        // floor(10 * 0.95) = 9 tasks must be in flight.
        let decision = evaluate(&input(9, 10, true, true), &config());
        assert_eq!(decision, ScaleDecision::ScaleUp { from: 10, to: 11 });
    }

    #[test]
    fn no_scale_up_when_underutilised() {
        let decision = evaluate(&input(8, 10, true, true), &config());
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn no_scale_up_when_currently_overloaded() {
        let decision = evaluate(&input(10, 10, false, true), &config());
        assert_eq!(decision, ScaleDecision::NoChange);
    }

    #[test]
    fn scale_down_ignores_current_status() {
        let decision = evaluate(&input(10, 10, true, false), &config());
        assert_eq!(decision, ScaleDecision::ScaleDown { from: 10, to: 9 });
    }

    #[test]
    fn scale_down_regardless_of_utilisation() {
        let decision = evaluate(&input(0, 10, false, false), &config());
        assert_eq!(decision, ScaleDecision::ScaleDown { from: 10, to: 9 });
    }

    #[test]
    fn step_is_ceiled() {
        // ceil(30 * 0.05) = ceil(1.5) = 2.
        let decision = evaluate(&input(29, 30, true, true), &config());
        assert_eq!(decision, ScaleDecision::ScaleUp { from: 30, to: 32 });
    }

    #[test]
    fn respects_max_concurrency() {
        let mut inp = input(49, 49, true, true);
        inp.max_concurrency = 49;
        assert_eq!(evaluate(&inp, &config()), ScaleDecision::NoChange);

        let mut inp = input(48, 48, true, true);
        inp.max_concurrency = 49;
        let big_steps = PoolConfig {
            scale_up_step_ratio: 0.5,
            ..config()
        };
        assert_eq!(
            evaluate(&inp, &big_steps),
            ScaleDecision::ScaleUp { from: 48, to: 49 }
        );
    }

    #[test]
    fn respects_min_concurrency() {
        let mut inp = input(0, 3, true, false);
        inp.min_concurrency = 3;
        assert_eq!(evaluate(&inp, &config()), ScaleDecision::NoChange);

        let mut inp = input(0, 4, true, false);
        inp.min_concurrency = 3;
        let big_steps = PoolConfig {
            scale_down_step_ratio: 0.9,
            ..config()
        };
        assert_eq!(
            evaluate(&inp, &big_steps),
            ScaleDecision::ScaleDown { from: 4, to: 3 }
        );
    }

    #[test]
    fn single_slot_pool_scales_from_one() {
        // floor(1 * 0.95) = 0, so an idle single-slot pool may grow.
        let decision = evaluate(&input(0, 1, true, true), &config());
        assert_eq!(decision, ScaleDecision::ScaleUp { from: 1, to: 2 });
    }

    #[test]
    fn target_applies_decision() {
        assert_eq!(ScaleDecision::NoChange.target(7), 7);
        assert_eq!(ScaleDecision::ScaleUp { from: 7, to: 8 }.target(7), 8);
        assert_eq!(ScaleDecision::ScaleDown { from: 7, to: 6 }.target(7), 6);
    }
}
