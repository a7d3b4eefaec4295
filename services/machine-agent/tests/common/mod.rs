//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_agent::controller::{ControllerConfig, MachineController, MonitorStrategy};
use kiln_agent::event::MachineEvent;
use kiln_agent::machine::{ContainerSpec, Machine, MachineSpec};
use kiln_agent::providers::mock::MockProviders;
use kiln_id::MachineId;
use kiln_reconcile::{DesiredState, MachineState};

pub fn spec(containers: usize) -> MachineSpec {
    MachineSpec {
        vcpus: 2,
        memory_mib: 512,
        containers: (0..containers)
            .map(|i| ContainerSpec::new(format!("c{i}"), format!("docker.io/library/app{i}:1"), 128))
            .collect(),
    }
}

pub fn machine(containers: usize, desired: DesiredState) -> Machine {
    Machine::new(MachineId::new(), spec(containers), desired)
}

/// Polling every 10ms, retrying after 5ms.
pub fn polling_config() -> ControllerConfig {
    ControllerConfig {
        monitor: MonitorStrategy::Polling {
            interval: Duration::from_millis(10),
        },
        retry_delay: Duration::from_millis(5),
    }
}

pub fn stream_config() -> ControllerConfig {
    ControllerConfig {
        monitor: MonitorStrategy::EventStream {
            max_backoff: Duration::from_millis(20),
            jitter: 0.0,
        },
        retry_delay: Duration::from_millis(5),
    }
}

/// Records every event dispatched on a controller's bus.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<MachineEvent>>>,
}

impl Recorder {
    pub fn attach(controller: &MachineController) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        controller.subscribe_to_events(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                anyhow::Ok(())
            }
        });
        recorder
    }

    pub fn events(&self) -> Vec<MachineEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The states of every `StateChanged` event, in dispatch order.
    pub fn states(&self) -> Vec<MachineState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MachineEvent::StateChanged { state } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Wait until the latest `StateChanged` announced `state`. Announcements
    /// are dispatched after the transition is stored.
    pub async fn observed(&self, state: MachineState) {
        eventually("state change to be announced", || {
            self.states().last() == Some(&state)
        })
        .await;
    }
}

/// Start a controller with a recorder attached before the first event.
pub fn start(
    machine: Machine,
    mocks: &MockProviders,
    config: ControllerConfig,
) -> (MachineController, Recorder) {
    let mut recorder = None;
    let controller = MachineController::with_observer(machine, mocks.providers(), config, |c| {
        recorder = Some(Recorder::attach(c));
    })
    .unwrap();
    (controller, recorder.unwrap())
}

pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_state(controller: &MachineController, state: MachineState) -> Machine {
    for _ in 0..1000 {
        let machine = controller.get_machine().await;
        if machine.state == state {
            return machine;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "machine never reached {state}, stuck in {}",
        controller.get_machine().await.state
    );
}

/// Wait until the controller has no reconciliation in flight.
pub async fn wait_until_idle(controller: &MachineController) {
    eventually("reconciliation to finish", || !controller.is_reconciling()).await;
}
