//! The no-progress budget.
//!
//! Rather than giving each task its own retry ceiling, the run loop counts
//! consecutive passes that complete nothing. A task that is correctly
//! waiting on a slow sibling never burns budget as long as something,
//! somewhere, finishes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Passes without progress allowed before a run is declared stagnant.
pub const DEFAULT_MAX_PASSES_WITHOUT_PROGRESS: u32 = 100;

/// Pause after an unproductive pass in which some task failed transiently.
pub const DEFAULT_PASS_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("no-progress budget must be a positive number of passes")]
    Zero,
}

/// Configuration of the no-progress budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBudget {
    /// Consecutive passes allowed to complete zero tasks.
    max_passes_without_progress: u32,

    /// Delay before the next pass after an unproductive, failing pass.
    #[serde(with = "serde_duration")]
    pass_delay: Duration,
}

impl ProgressBudget {
    /// Create a budget of `max` unproductive passes.
    pub fn new(max: u32) -> Result<Self, BudgetError> {
        if max == 0 {
            return Err(BudgetError::Zero);
        }
        Ok(Self {
            max_passes_without_progress: max,
            pass_delay: DEFAULT_PASS_DELAY,
        })
    }

    /// Builder: set the pause between unproductive passes.
    pub fn with_pass_delay(mut self, delay: Duration) -> Self {
        self.pass_delay = delay;
        self
    }

    pub fn max_passes_without_progress(&self) -> u32 {
        self.max_passes_without_progress
    }

    pub fn pass_delay(&self) -> Duration {
        self.pass_delay
    }

    /// Start a fresh counter for one run.
    pub fn tracker(&self) -> BudgetTracker {
        BudgetTracker {
            max: self.max_passes_without_progress,
            remaining: self.max_passes_without_progress,
        }
    }
}

impl Default for ProgressBudget {
    fn default() -> Self {
        Self {
            max_passes_without_progress: DEFAULT_MAX_PASSES_WITHOUT_PROGRESS,
            pass_delay: DEFAULT_PASS_DELAY,
        }
    }
}

/// Outcome of recording one pass against the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetState {
    /// The pass made progress; the budget is full again.
    Reset,
    /// The pass made no progress; `remaining` passes are left.
    Spent { remaining: u32 },
    /// No budget left.
    Exhausted,
}

/// Runtime counter for a single convergence run.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    max: u32,
    remaining: u32,
}

impl BudgetTracker {
    pub fn record_pass(&mut self, progress: bool) -> BudgetState {
        if progress {
            self.remaining = self.max;
            return BudgetState::Reset;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            BudgetState::Exhausted
        } else {
            BudgetState::Spent {
                remaining: self.remaining,
            }
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Consecutive unproductive passes so far.
    pub fn stagnant_passes(&self) -> u32 {
        self.max - self.remaining
    }
}

/// Serializes Duration as whole seconds (matching the YAML manifest).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
