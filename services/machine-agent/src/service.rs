//! Machine service: the registry of controllers on this host.
//!
//! The service creates controllers, restores them after a restart and fans
//! their events out to the durable event log and to live watchers.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use kiln_id::MachineId;
use kiln_reconcile::DesiredState;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::controller::{ControllerConfig, ControllerError, MachineController};
use crate::event::MachineEvent;
use crate::machine::{Machine, MachineField, MachineSpec};
use crate::providers::{PersistenceError, Providers};

/// Buffered events per watcher before it starts lagging.
const WATCH_CAPACITY: usize = 1024;

/// An event from one of the service's machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub machine_id: MachineId,
    pub event: MachineEvent,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown machine: {0}")]
    UnknownMachine(MachineId),

    #[error("machine already registered: {0}")]
    AlreadyExists(MachineId),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub struct MachineService {
    controllers: DashMap<MachineId, Arc<MachineController>>,
    providers: Providers,
    config: ControllerConfig,
    events: broadcast::Sender<ServiceEvent>,
}

impl MachineService {
    pub fn new(providers: Providers, config: ControllerConfig) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            controllers: DashMap::new(),
            providers,
            config,
            events,
        }
    }

    /// Start a controller for every persisted machine that is not yet
    /// terminated. Returns how many were started.
    pub async fn load(&self) -> Result<usize, ServiceError> {
        let machines = self.providers.persistence.load_machines().await?;
        let mut started = 0;

        for machine in machines {
            if machine.state.is_terminal() {
                debug!(machine_id = %machine.id, "Skipping terminated machine");
                continue;
            }
            if self.controllers.contains_key(&machine.id) {
                continue;
            }

            info!(
                machine_id = %machine.id,
                state = %machine.state,
                desired_state = %machine.desired_state,
                "Restoring machine"
            );
            self.register(machine)?;
            started += 1;
        }

        info!(machines = started, "Machines restored");
        Ok(started)
    }

    /// Create a machine and start converging it on `desired`.
    pub async fn create(
        &self,
        spec: MachineSpec,
        desired: DesiredState,
    ) -> Result<Machine, ServiceError> {
        let machine = Machine::new(MachineId::new(), spec, desired);
        self.providers
            .persistence
            .save(&machine, &MachineField::ALL)
            .await?;

        info!(
            machine_id = %machine.id,
            containers = machine.containers().len(),
            desired_state = %desired,
            "Machine created"
        );

        self.register(machine.clone())?;
        Ok(machine)
    }

    pub fn get(&self, machine_id: MachineId) -> Result<Arc<MachineController>, ServiceError> {
        self.controllers
            .get(&machine_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ServiceError::UnknownMachine(machine_id))
    }

    /// A snapshot of one machine.
    pub async fn machine(&self, machine_id: MachineId) -> Result<Machine, ServiceError> {
        Ok(self.get(machine_id)?.get_machine().await)
    }

    /// Snapshots of every registered machine, oldest first.
    pub async fn list(&self) -> Vec<Machine> {
        let controllers = self.controllers();
        let mut machines = join_all(controllers.iter().map(|c| c.get_machine())).await;
        machines.sort_by_key(|m| m.created_at);
        machines
    }

    pub async fn set_desired_state(
        &self,
        machine_id: MachineId,
        desired: DesiredState,
    ) -> Result<(), ServiceError> {
        self.get(machine_id)?
            .set_desired_state(desired)
            .await
            .map_err(Into::into)
    }

    /// Stop managing a machine and return its last state. Its resources are
    /// left as they are; set it to `Terminated` first to release them.
    pub async fn remove(&self, machine_id: MachineId) -> Result<Machine, ServiceError> {
        let (_, controller) = self
            .controllers
            .remove(&machine_id)
            .ok_or(ServiceError::UnknownMachine(machine_id))?;

        controller.stop().await;
        let machine = controller.get_machine().await;
        info!(machine_id = %machine_id, state = %machine.state, "Machine removed");
        Ok(machine)
    }

    /// Stop every controller.
    pub async fn shutdown(&self) {
        let controllers = self.controllers();
        self.controllers.clear();

        info!(machines = controllers.len(), "Stopping machine controllers");
        join_all(controllers.iter().map(|c| c.stop())).await;
    }

    /// Subscribe to events from every machine.
    pub fn watch(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    fn controllers(&self) -> Vec<Arc<MachineController>> {
        self.controllers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn register(&self, machine: Machine) -> Result<(), ServiceError> {
        let machine_id = machine.id;
        let entry = match self.controllers.entry(machine_id) {
            Entry::Occupied(_) => return Err(ServiceError::AlreadyExists(machine_id)),
            Entry::Vacant(entry) => entry,
        };

        let persistence = Arc::clone(&self.providers.persistence);
        let events = self.events.clone();

        let controller = MachineController::with_observer(
            machine,
            self.providers.clone(),
            self.config.clone(),
            move |controller| {
                controller.subscribe_to_events(move |event: MachineEvent| {
                    let persistence = Arc::clone(&persistence);
                    let events = events.clone();
                    async move {
                        if event.is_durable() {
                            if let Err(e) = persistence.append_event(machine_id, &event).await {
                                warn!(
                                    machine_id = %machine_id,
                                    event = event.kind(),
                                    error = %e,
                                    "Failed to append event"
                                );
                            }
                        }
                        // No watchers is fine.
                        let _ = events.send(ServiceEvent { machine_id, event });
                        anyhow::Ok(())
                    }
                });
            },
        )?;

        entry.insert(Arc::new(controller));
        Ok(())
    }
}

impl std::fmt::Debug for MachineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineService")
            .field("machines", &self.controllers.len())
            .finish()
    }
}
