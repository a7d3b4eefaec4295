//! Machine lifecycle states and the convergence predicate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// Observed lifecycle state of a machine.
///
/// ```text
/// pending -> starting -> running <-> degraded
///               |          |           |
///               +-------> error <------+
///
/// any -> terminating -> terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Pending,
    Starting,
    Running,
    Degraded,
    Error,
    Terminating,
    Terminated,
}

impl MachineState {
    pub const ALL: [MachineState; 7] = [
        MachineState::Pending,
        MachineState::Starting,
        MachineState::Running,
        MachineState::Degraded,
        MachineState::Error,
        MachineState::Terminating,
        MachineState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// No transition leaves this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ReconcileError::UnknownState(s.to_string()))
    }
}

/// Lifecycle state a machine is asked to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// Resources prepared, hypervisor not running.
    Pending,
    Running,
    Terminated,
}

impl DesiredState {
    pub const ALL: [DesiredState; 3] = [
        DesiredState::Pending,
        DesiredState::Running,
        DesiredState::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredState {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|desired| desired.as_str() == s)
            .ok_or_else(|| ReconcileError::UnknownDesiredState(s.to_string()))
    }
}

/// True when `state` satisfies `desired` and no reconciliation is needed.
///
/// `Starting`, `Error` and `Terminating` never satisfy anything.
pub fn matches(state: MachineState, desired: DesiredState) -> bool {
    match state {
        MachineState::Pending => desired == DesiredState::Pending,
        MachineState::Running | MachineState::Degraded => desired == DesiredState::Running,
        MachineState::Terminated => desired == DesiredState::Terminated,
        MachineState::Starting | MachineState::Error | MachineState::Terminating => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MachineState::Pending, DesiredState::Pending, true)]
    #[case(MachineState::Pending, DesiredState::Running, false)]
    #[case(MachineState::Pending, DesiredState::Terminated, false)]
    #[case(MachineState::Starting, DesiredState::Pending, false)]
    #[case(MachineState::Starting, DesiredState::Running, false)]
    #[case(MachineState::Starting, DesiredState::Terminated, false)]
    #[case(MachineState::Running, DesiredState::Running, true)]
    #[case(MachineState::Running, DesiredState::Pending, false)]
    #[case(MachineState::Degraded, DesiredState::Running, true)]
    #[case(MachineState::Degraded, DesiredState::Terminated, false)]
    #[case(MachineState::Error, DesiredState::Running, false)]
    #[case(MachineState::Error, DesiredState::Pending, false)]
    #[case(MachineState::Terminating, DesiredState::Terminated, false)]
    #[case(MachineState::Terminated, DesiredState::Terminated, true)]
    #[case(MachineState::Terminated, DesiredState::Running, false)]
    fn test_matches(
        #[case] state: MachineState,
        #[case] desired: DesiredState,
        #[case] expected: bool,
    ) {
        assert_eq!(matches(state, desired), expected);
    }

    #[test]
    fn test_transitional_states_never_match() {
        for state in [
            MachineState::Starting,
            MachineState::Error,
            MachineState::Terminating,
        ] {
            for desired in DesiredState::ALL {
                assert!(!matches(state, desired), "{state} matched {desired}");
            }
        }
    }

    #[test]
    fn test_state_str_roundtrip() {
        for state in MachineState::ALL {
            assert_eq!(state.as_str().parse::<MachineState>().unwrap(), state);
        }
        for desired in DesiredState::ALL {
            assert_eq!(desired.as_str().parse::<DesiredState>().unwrap(), desired);
        }
        assert!("booting".parse::<MachineState>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&MachineState::Terminating).unwrap();
        assert_eq!(json, "\"terminating\"");
        let desired: DesiredState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(desired, DesiredState::Running);
    }

    #[test]
    fn test_only_terminated_is_terminal() {
        let terminal: Vec<_> = MachineState::ALL
            .into_iter()
            .filter(MachineState::is_terminal)
            .collect();
        assert_eq!(terminal, vec![MachineState::Terminated]);
    }
}
