//! Events flowing through a machine controller's bus.

use kiln_id::ContainerId;
use kiln_reconcile::{DesiredState, MachineState};
use serde::{Deserialize, Serialize};

use crate::machine::ContainerState;

/// Everything that can happen to a machine.
///
/// `StateChanged` and `ContainerStateChanged` are the externally visible,
/// durably logged events. `StateChanged` is published by the controller
/// only after it applied the transition; reconciliation and monitoring ask
/// for one with `StateRequested`, which the controller may refuse. The
/// non-durable events drive the controller and are only forwarded for
/// observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MachineEvent {
    DesiredStateChanged {
        desired_state: DesiredState,
    },
    /// A transition asked for by reconciliation or a health verdict.
    StateRequested {
        state: MachineState,
    },
    StateChanged {
        state: MachineState,
    },
    ContainerStateChanged {
        container_id: ContainerId,
        state: ContainerState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Outcome of one health probe; `error` is set when it failed.
    Healthcheck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl MachineEvent {
    pub fn state_changed(state: MachineState) -> Self {
        Self::StateChanged { state }
    }

    pub fn state_requested(state: MachineState) -> Self {
        Self::StateRequested { state }
    }

    pub fn healthy() -> Self {
        Self::Healthcheck { error: None }
    }

    pub fn unhealthy(error: impl ToString) -> Self {
        Self::Healthcheck {
            error: Some(error.to_string()),
        }
    }

    /// Stable name, also the `type` tag of the JSON form.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DesiredStateChanged { .. } => "desired_state_changed",
            Self::StateRequested { .. } => "state_requested",
            Self::StateChanged { .. } => "state_changed",
            Self::ContainerStateChanged { .. } => "container_state_changed",
            Self::Healthcheck { .. } => "healthcheck",
        }
    }

    /// Whether the surrounding service appends this event to the durable
    /// event log.
    pub fn is_durable(&self) -> bool {
        matches!(
            self,
            Self::StateChanged { .. } | Self::ContainerStateChanged { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_serde_tag() {
        let events = [
            MachineEvent::DesiredStateChanged {
                desired_state: DesiredState::Running,
            },
            MachineEvent::state_changed(MachineState::Starting),
            MachineEvent::state_requested(MachineState::Error),
            MachineEvent::ContainerStateChanged {
                container_id: ContainerId::new(),
                state: ContainerState::Exited,
                exit_code: Some(137),
            },
            MachineEvent::unhealthy("connection refused"),
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
            let parsed: MachineEvent = serde_json::from_value(json).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn test_only_state_events_are_durable() {
        assert!(MachineEvent::state_changed(MachineState::Running).is_durable());
        assert!(!MachineEvent::state_requested(MachineState::Running).is_durable());
        assert!(!MachineEvent::healthy().is_durable());
        assert!(!MachineEvent::DesiredStateChanged {
            desired_state: DesiredState::Terminated
        }
        .is_durable());
    }
}
