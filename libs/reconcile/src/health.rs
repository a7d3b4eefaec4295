//! Debounced health verdicts.

use crate::state::MachineState;

/// Consecutive failures after which a machine is considered failed.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Outcome of folding one healthcheck result into the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Failing, but fewer than the threshold in a row.
    Degraded,
    /// At least the threshold of consecutive failures.
    Failed,
}

impl HealthVerdict {
    /// The lifecycle state this verdict demotes or promotes a machine to.
    pub fn target_state(&self) -> MachineState {
        match self {
            Self::Healthy => MachineState::Running,
            Self::Degraded => MachineState::Degraded,
            Self::Failed => MachineState::Error,
        }
    }
}

/// Consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct HealthCounter {
    consecutive_failures: u32,
    threshold: u32,
}

impl Default for HealthCounter {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD)
    }
}

impl HealthCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn record_success(&mut self) -> HealthVerdict {
        self.consecutive_failures = 0;
        HealthVerdict::Healthy
    }

    pub fn record_failure(&mut self) -> HealthVerdict {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.threshold {
            HealthVerdict::Failed
        } else {
            HealthVerdict::Degraded
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}
