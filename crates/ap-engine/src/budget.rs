//! Wall-clock budgets for workers running under a batch scheduler.

use std::time::{Duration, Instant};

/// Tells a loop whether it should stop before starting another step.
pub trait PreemptionSignal: Send {
    fn should_stop(&self) -> bool;

    /// Called after each completed step with its duration.
    fn observe_step(&mut self, _elapsed: Duration) {}
}

/// Never preempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbounded;

impl PreemptionSignal for Unbounded {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Stops once the time left can no longer fit another step.
///
/// The expected step length is the larger of the configured reserve and the
/// longest step seen so far.
#[derive(Debug, Clone)]
pub struct WallClockBudget {
    started: Instant,
    budget: Duration,
    reserve: Duration,
    longest_step: Duration,
}

impl WallClockBudget {
    pub fn new(budget: Duration, reserve: Duration) -> Self {
        Self::starting_at(Instant::now(), budget, reserve)
    }

    pub fn starting_at(started: Instant, budget: Duration, reserve: Duration) -> Self {
        Self {
            started,
            budget,
            reserve,
            longest_step: Duration::ZERO,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }
}

impl PreemptionSignal for WallClockBudget {
    fn should_stop(&self) -> bool {
        self.remaining() <= self.reserve.max(self.longest_step)
    }

    fn observe_step(&mut self, elapsed: Duration) {
        self.longest_step = self.longest_step.max(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_budget_allows_work() {
        let budget = WallClockBudget::new(Duration::from_secs(3600), Duration::from_secs(60));
        assert!(!budget.should_stop());
        assert!(!Unbounded.should_stop());
    }

    #[test]
    fn reserve_larger_than_budget_stops_immediately() {
        let budget = WallClockBudget::new(Duration::from_secs(30), Duration::from_secs(60));
        assert!(budget.should_stop());
    }

    #[test]
    fn long_steps_raise_the_bar() {
        let mut budget = WallClockBudget::new(Duration::from_secs(600), Duration::from_secs(1));
        assert!(!budget.should_stop());
        budget.observe_step(Duration::from_secs(900));
        assert!(budget.should_stop());
    }
}
