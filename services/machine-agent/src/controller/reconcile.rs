//! The reconciliation task.
//!
//! One task converges a machine toward a single desired state. It retries
//! its procedure until it succeeds or its token is cancelled. Every step
//! checks what is already in place first, so a retry resumes from wherever
//! the previous attempt stopped.

use std::sync::Arc;

use kiln_events::BusError;
use kiln_reconcile::{DesiredState, MachineState};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ControllerCore;
use crate::event::MachineEvent;
use crate::machine::{Machine, MachineField, VolumeBinding};
use crate::providers::ProviderError;

#[derive(Debug, Error)]
enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("machine is terminated")]
    Terminated,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub(super) async fn run(core: Arc<ControllerCore>, target: DesiredState, cancel: CancellationToken) {
    Reconciliation {
        core,
        target,
        cancel,
        torn_down: false,
    }
    .run()
    .await
}

struct Reconciliation {
    core: Arc<ControllerCore>,
    target: DesiredState,
    cancel: CancellationToken,
    /// Set once the teardown that precedes a restart from `Error` is done,
    /// so retries do not repeat it.
    torn_down: bool,
}

impl Reconciliation {
    async fn run(mut self) {
        let machine_id = self.core.id;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let result = match self.target {
                DesiredState::Pending => self.to_pending().await,
                DesiredState::Running => self.to_running().await,
                DesiredState::Terminated => self.to_terminated().await,
            };

            match result {
                Ok(()) => {
                    info!(machine_id = %machine_id, target = %self.target, attempt, "Reconciliation finished");
                    return;
                }
                Err(StepError::Cancelled | StepError::Bus(_)) => {
                    debug!(machine_id = %machine_id, target = %self.target, attempt, "Reconciliation cancelled");
                    return;
                }
                Err(StepError::Terminated) => {
                    warn!(machine_id = %machine_id, target = %self.target, "Machine is terminated, giving up");
                    return;
                }
                Err(e) => {
                    warn!(
                        machine_id = %machine_id,
                        target = %self.target,
                        attempt,
                        error = %e,
                        "Reconciliation attempt failed"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.core.config.retry_delay) => {}
            }
        }
    }

    // =========================================================================
    // Procedures
    // =========================================================================

    async fn to_pending(&self) -> Result<(), StepError> {
        self.ensure_not_terminated().await?;

        if self.machine().await.runtime_pid.is_some() {
            self.checkpoint()?;
            self.terminate_runtime().await?;
        }

        self.prepare().await?;

        if self.machine().await.state != MachineState::Pending {
            self.transition(MachineState::Pending).await?;
        }
        Ok(())
    }

    async fn to_running(&mut self) -> Result<(), StepError> {
        self.ensure_not_terminated().await?;

        if self.machine().await.state == MachineState::Error && !self.torn_down {
            self.teardown().await?;
            self.torn_down = true;
        }

        self.prepare().await?;

        let machine = self.machine().await;
        if machine.runtime_pid.is_some() {
            if matches!(
                machine.state,
                MachineState::Starting | MachineState::Running | MachineState::Degraded
            ) {
                debug!(machine_id = %machine.id, state = %machine.state, "Runtime already up");
                return Ok(());
            }
            self.checkpoint()?;
            self.terminate_runtime().await?;
        }

        self.checkpoint()?;
        let machine = self.machine().await;
        let pid = self.core.providers.runtime.create(&machine).await?;
        self.record(&[MachineField::RuntimePid], |m| {
            m.runtime_pid = Some(pid);
        })
        .await;
        info!(machine_id = %machine.id, pid, "Runtime created");

        self.checkpoint()?;
        self.core.providers.runtime.boot(machine.id).await?;
        info!(machine_id = %machine.id, "Machine booted");

        self.transition(MachineState::Starting).await
    }

    /// Also releases whatever a superseded attempt left behind on a machine
    /// that is already terminated.
    async fn to_terminated(&self) -> Result<(), StepError> {
        let state = self.machine().await.state;
        if !matches!(state, MachineState::Terminating | MachineState::Terminated) {
            self.transition(MachineState::Terminating).await?;
        }

        self.teardown().await?;

        if self.machine().await.state.is_terminal() {
            return Ok(());
        }
        self.transition(MachineState::Terminated).await
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Ensure one volume per container and a network interface.
    async fn prepare(&self) -> Result<(), StepError> {
        let machine = self.machine().await;
        let providers = &self.core.providers;

        for container in machine.containers() {
            if machine.volume_for(container.id).is_some() {
                continue;
            }

            self.checkpoint()?;
            let image = providers.images.fetch(&container.image).await?;

            self.checkpoint()?;
            let volume = providers
                .volumes
                .create(container.volume_size_mib, Some(&image.rootfs))
                .await?;

            info!(
                machine_id = %machine.id,
                container = %container.name,
                volume_id = %volume.id,
                image = %image.reference,
                "Volume created"
            );

            let binding = VolumeBinding {
                container_id: container.id,
                volume,
            };
            self.record(&[MachineField::Volumes], |m| m.volumes.push(binding))
                .await;
        }

        if machine.network_interface.is_none() {
            self.checkpoint()?;
            let interface = providers.network.allocate_interface(machine.id).await?;

            info!(
                machine_id = %machine.id,
                tap = %interface.tap_name,
                address = %interface.address,
                "Network interface allocated"
            );

            self.record(&[MachineField::NetworkInterface], |m| {
                m.network_interface = Some(interface);
            })
            .await;
        }

        Ok(())
    }

    /// Terminate the runtime, release the network and delete every volume.
    async fn teardown(&self) -> Result<(), StepError> {
        let machine = self.machine().await;
        let providers = &self.core.providers;

        if machine.runtime_pid.is_some() {
            self.checkpoint()?;
            self.terminate_runtime().await?;
        }

        if let Some(interface) = &machine.network_interface {
            self.checkpoint()?;
            providers.network.release_interface(interface).await?;
            info!(machine_id = %machine.id, tap = %interface.tap_name, "Network interface released");
            self.record(&[MachineField::NetworkInterface], |m| {
                m.network_interface = None;
            })
            .await;
        }

        for binding in &machine.volumes {
            self.checkpoint()?;
            providers.volumes.delete(&binding.volume).await?;
            info!(machine_id = %machine.id, volume_id = %binding.volume.id, "Volume deleted");

            let volume_id = binding.volume.id;
            self.record(&[MachineField::Volumes], |m| {
                m.volumes.retain(|b| b.volume.id != volume_id);
            })
            .await;
        }

        Ok(())
    }

    async fn terminate_runtime(&self) -> Result<(), StepError> {
        self.core.providers.runtime.terminate(self.core.id).await?;
        info!(machine_id = %self.core.id, "Runtime terminated");
        self.record(&[MachineField::RuntimePid], |m| {
            m.runtime_pid = None;
        })
        .await;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn machine(&self) -> Machine {
        self.core.snapshot().await
    }

    async fn ensure_not_terminated(&self) -> Result<(), StepError> {
        if self.machine().await.state.is_terminal() {
            Err(StepError::Terminated)
        } else {
            Ok(())
        }
    }

    fn checkpoint(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a resource change. Failing to persist it is logged and
    /// otherwise ignored: the next save carries the whole machine.
    async fn record<F>(&self, fields: &[MachineField], mutate: F)
    where
        F: FnOnce(&mut Machine),
    {
        self.core
            .update(fields, |m| {
                mutate(m);
                true
            })
            .await;
    }

    /// Request a state change and wait until the controller has handled it.
    async fn transition(&self, state: MachineState) -> Result<(), StepError> {
        let seq = self
            .core
            .bus
            .publish(MachineEvent::state_requested(state))?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled),
            settled = self.core.bus.settled(seq) => settled.map_err(Into::into),
        }
    }
}
