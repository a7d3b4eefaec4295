//! Per-machine controller.
//!
//! One controller owns the authoritative in-memory copy of one machine. All
//! changes arrive as [`MachineEvent`]s on the controller's own bus and are
//! applied one at a time by its handler. Reconciliation and monitoring run as
//! background tasks that observe the machine and request transitions with
//! `StateRequested`; they never write `state` themselves. Every transition
//! the handler applies is announced as `StateChanged`.
//!
//! ```text
//! set_desired_state ──► bus ──► handler ──► update (lock + persist)
//!                        ▲          │
//!                        │          ├─► reconcile task ──► providers
//!                        │          └─► monitor task ────► runtime / guest
//!                        └──────────────────┘ StateRequested / Healthcheck
//! ```

mod monitor;
mod reconcile;

pub use monitor::MonitorStrategy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_events::{BusError, EventBus, Subscription};
use kiln_id::MachineId;
use kiln_reconcile::{
    DesiredState, HealthCounter, HealthVerdict, MachineState, StartOutcome, TaskSlot,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::MachineEvent;
use crate::machine::{Machine, MachineField};
use crate::providers::{PersistenceError, Providers};

/// How long `stop` waits for each background task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How liveness is observed.
    pub monitor: MonitorStrategy,

    /// Pause between failed reconciliation attempts.
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorStrategy::default(),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Errors returned to callers of the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller for {0} is stopped")]
    Stopped(MachineId),

    #[error("machine {machine_id} is terminated and cannot become {desired}")]
    Terminal {
        machine_id: MachineId,
        desired: DesiredState,
    },

    #[error("event-stream monitoring requires a guest event client")]
    MissingGuestEvents,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Drives one machine toward its desired state.
pub struct MachineController {
    inner: Arc<ControllerCore>,
}

impl MachineController {
    /// Start a controller for `machine`.
    ///
    /// Resumes convergence immediately if the machine was loaded mid-way
    /// through a transition.
    pub fn new(
        machine: Machine,
        providers: Providers,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        Self::with_observer(machine, providers, config, |_| {})
    }

    /// Like [`MachineController::new`], but runs `observe` before any event
    /// is dispatched, so subscriptions made there see every event.
    pub fn with_observer<F>(
        machine: Machine,
        providers: Providers,
        config: ControllerConfig,
        observe: F,
    ) -> Result<Self, ControllerError>
    where
        F: FnOnce(&MachineController),
    {
        if matches!(config.monitor, MonitorStrategy::EventStream { .. })
            && providers.guest_events.is_none()
        {
            return Err(ControllerError::MissingGuestEvents);
        }

        let id = machine.id;
        let state = machine.state;
        let snapshot = machine.clone();

        let core = Arc::new(ControllerCore {
            id,
            machine: RwLock::new(machine),
            bus: EventBus::new(format!("machine:{id}")),
            providers,
            config,
            lifecycle: CancellationToken::new(),
            reconciliation: TaskSlot::new("reconcile"),
            monitor: TaskSlot::new("monitor"),
            health: Mutex::new(HealthCounter::default()),
            stopped: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        core.bus.subscribe(move |event: MachineEvent| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(core) => core.handle_event(event).await,
                    None => Ok(()),
                }
            }
        });

        let controller = Self { inner: core };
        observe(&controller);

        let dispatcher = controller.inner.bus.start(controller.inner.lifecycle.clone())?;
        *controller
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        info!(
            machine_id = %id,
            state = %state,
            desired_state = %snapshot.desired_state,
            "Machine controller started"
        );

        controller.inner.sync_monitor(state);
        controller.inner.reconcile_if_needed(&snapshot);

        Ok(controller)
    }

    pub fn id(&self) -> MachineId {
        self.inner.id
    }

    /// A point-in-time copy of the machine.
    pub async fn get_machine(&self) -> Machine {
        self.inner.snapshot().await
    }

    /// Ask the machine to converge on `desired`. Returns once the request is
    /// queued, not once it is reached.
    pub async fn set_desired_state(&self, desired: DesiredState) -> Result<(), ControllerError> {
        if self.is_stopped() {
            return Err(ControllerError::Stopped(self.inner.id));
        }

        let state = self.inner.machine.read().await.state;
        if state.is_terminal() && desired != DesiredState::Terminated {
            return Err(ControllerError::Terminal {
                machine_id: self.inner.id,
                desired,
            });
        }

        self.inner
            .bus
            .publish(MachineEvent::DesiredStateChanged {
                desired_state: desired,
            })
            .map_err(|_| ControllerError::Stopped(self.inner.id))?;

        debug!(machine_id = %self.inner.id, desired_state = %desired, "Desired state requested");
        Ok(())
    }

    /// Register a handler for every event dispatched on this controller's bus
    /// from now on.
    pub fn subscribe_to_events<F, Fut>(&self, handler: F) -> Subscription<MachineEvent>
    where
        F: Fn(MachineEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.bus.subscribe(handler)
    }

    /// Cancel reconciliation and monitoring and stop dispatching events.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(machine_id = %self.inner.id, "Stopping machine controller");

        let reconciliation = self.inner.reconciliation.cancel();
        let monitor = self.inner.monitor.cancel();
        self.inner.lifecycle.cancel();
        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        for handle in [reconciliation, monitor, dispatcher].into_iter().flatten() {
            wait_or_abort(self.inner.id, handle).await;
        }

        debug!(machine_id = %self.inner.id, "Machine controller stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_reconciling(&self) -> bool {
        self.inner.reconciliation.is_active()
    }

    /// Desired state the running reconciliation works toward.
    pub fn reconciliation_target(&self) -> Option<DesiredState> {
        self.inner.reconciliation.active_key()
    }

    /// When the running reconciliation started.
    pub fn reconciliation_started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.reconciliation.started_at()
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.is_active()
    }

    /// Consecutive failed healthchecks since the last success.
    pub fn consecutive_health_failures(&self) -> u32 {
        self.inner.health().consecutive_failures()
    }
}

impl Drop for MachineController {
    fn drop(&mut self) {
        self.inner.lifecycle.cancel();
    }
}

impl std::fmt::Debug for MachineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineController")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn wait_or_abort(machine_id: MachineId, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
        warn!(machine_id = %machine_id, "Task did not stop in time, aborting");
        abort.abort();
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// Result of [`ControllerCore::update`].
struct Update {
    /// The machine after the update.
    machine: Machine,
    /// Outcome of the durable write. The in-memory copy keeps the change
    /// either way.
    saved: Result<(), PersistenceError>,
}

struct ControllerCore {
    id: MachineId,
    machine: RwLock<Machine>,
    bus: EventBus<MachineEvent>,
    providers: Providers,
    config: ControllerConfig,
    lifecycle: CancellationToken,
    reconciliation: TaskSlot<DesiredState>,
    monitor: TaskSlot<()>,
    health: Mutex<HealthCounter>,
    stopped: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerCore {
    async fn snapshot(&self) -> Machine {
        self.machine.read().await.clone()
    }

    fn health(&self) -> std::sync::MutexGuard<'_, HealthCounter> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the machine and persist it under one write lock.
    ///
    /// `mutate` returns whether it changed anything; nothing is written
    /// when it did not.
    async fn update<F>(&self, fields: &[MachineField], mutate: F) -> Update
    where
        F: FnOnce(&mut Machine) -> bool,
    {
        let mut machine = self.machine.write().await;
        if !mutate(&mut machine) {
            return Update {
                machine: machine.clone(),
                saved: Ok(()),
            };
        }
        machine.updated_at = Utc::now();

        let saved = self.providers.persistence.save(&machine, fields).await;
        if let Err(e) = &saved {
            warn!(machine_id = %self.id, ?fields, error = %e, "Failed to persist machine");
        }

        Update {
            machine: machine.clone(),
            saved,
        }
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    async fn handle_event(self: Arc<Self>, event: MachineEvent) -> anyhow::Result<()> {
        match event {
            MachineEvent::DesiredStateChanged { desired_state } => {
                self.on_desired_state_changed(desired_state).await
            }
            MachineEvent::StateRequested { state } => self.on_state_requested(state).await,
            MachineEvent::Healthcheck { error } => self.on_healthcheck(error).await,
            // Only of interest to external subscribers.
            MachineEvent::StateChanged { .. } | MachineEvent::ContainerStateChanged { .. } => Ok(()),
        }
    }

    async fn on_desired_state_changed(self: &Arc<Self>, desired: DesiredState) -> anyhow::Result<()> {
        let mut refused = false;
        let Update { machine, saved } = self
            .update(&[MachineField::DesiredState], |m| {
                // The request may have been accepted while the machine was
                // still terminating.
                if m.state.is_terminal() && desired != DesiredState::Terminated {
                    refused = true;
                    return false;
                }
                if m.desired_state == desired {
                    return false;
                }
                m.desired_state = desired;
                true
            })
            .await;

        if refused {
            warn!(
                machine_id = %self.id,
                desired_state = %desired,
                "Refusing desired state for terminated machine"
            );
            return Err(ControllerError::Terminal {
                machine_id: self.id,
                desired,
            }
            .into());
        }

        info!(
            machine_id = %self.id,
            state = %machine.state,
            desired_state = %desired,
            "Desired state changed"
        );

        self.reconcile_if_needed(&machine);
        saved.map_err(Into::into)
    }

    async fn on_state_requested(self: &Arc<Self>, state: MachineState) -> anyhow::Result<()> {
        let observes = |s: MachineState| self.config.monitor.observes(s);
        let mut previous = None;

        let Update { machine, saved } = self
            .update(&[MachineField::State, MachineField::DesiredState], |m| {
                if m.state == state || m.state.is_terminal() {
                    return false;
                }
                // Running, Degraded and Error are health verdicts. One
                // computed before the machine left observation is stale.
                if is_health_verdict(state) && !observes(m.state) {
                    return false;
                }
                previous = Some(m.state);
                m.state = state;
                // Nothing can be reached from Terminated.
                if state.is_terminal() {
                    m.desired_state = DesiredState::Terminated;
                }
                true
            })
            .await;

        let Some(from) = previous else {
            if machine.state != state {
                warn!(
                    machine_id = %self.id,
                    state = %machine.state,
                    requested = %state,
                    "Ignoring state transition"
                );
            }
            return Ok(());
        };

        info!(machine_id = %self.id, from = %from, to = %state, "Machine state changed");
        self.bus.publish(MachineEvent::state_changed(state))?;

        if state == MachineState::Starting {
            self.health().reset();
        }

        self.sync_monitor(state);
        self.reconcile_if_needed(&machine);
        saved.map_err(Into::into)
    }

    async fn on_healthcheck(self: &Arc<Self>, error: Option<String>) -> anyhow::Result<()> {
        let state = self.machine.read().await.state;
        if !self.config.monitor.observes(state) {
            debug!(machine_id = %self.id, state = %state, "Healthcheck outside observation ignored");
            return Ok(());
        }

        let verdict = {
            let mut health = self.health();
            match &error {
                None => health.record_success(),
                Some(_) => health.record_failure(),
            }
        };

        if let Some(error) = &error {
            debug!(
                machine_id = %self.id,
                consecutive_failures = self.health().consecutive_failures(),
                error = %error,
                "Healthcheck failed"
            );
        }

        let target = verdict.target_state();
        if target != state {
            if verdict == HealthVerdict::Failed {
                warn!(machine_id = %self.id, "Healthcheck failure threshold reached");
            }
            self.bus.publish(MachineEvent::state_requested(target))?;
        }
        Ok(())
    }

    // =========================================================================
    // Background tasks
    // =========================================================================

    /// Start reconciliation if `machine` has not converged.
    ///
    /// A converged machine still gets a task when one toward another target
    /// is running: that task may already have acted (a runtime created, a
    /// runtime stopped) and the replacement puts things back in line.
    fn reconcile_if_needed(self: &Arc<Self>, machine: &Machine) {
        if self.lifecycle.is_cancelled() {
            return;
        }

        let target = machine.desired_state;
        if machine.state.is_terminal() && target != DesiredState::Terminated {
            return;
        }
        let obsolete_task = self
            .reconciliation
            .active_key()
            .is_some_and(|active| active != target);
        if machine.is_converged() && !obsolete_task {
            return;
        }

        let core = Arc::clone(self);
        let outcome = self
            .reconciliation
            .start(target, &self.lifecycle, move |cancel| {
                reconcile::run(core, target, cancel)
            });

        match outcome {
            StartOutcome::AlreadyRunning => {}
            StartOutcome::Started | StartOutcome::Superseded => info!(
                machine_id = %self.id,
                state = %machine.state,
                target = %target,
                superseded = outcome == StartOutcome::Superseded,
                "Reconciliation started"
            ),
        }
    }

    /// Run the monitor exactly while `state` is under observation.
    fn sync_monitor(self: &Arc<Self>, state: MachineState) {
        if !self.lifecycle.is_cancelled() && self.config.monitor.observes(state) {
            let core = Arc::clone(self);
            let outcome = self
                .monitor
                .start((), &self.lifecycle, move |cancel| monitor::run(core, cancel));
            if outcome == StartOutcome::Started {
                debug!(machine_id = %self.id, state = %state, "Monitor started");
            }
        } else if self.monitor.cancel().is_some() {
            debug!(machine_id = %self.id, state = %state, "Monitor stopped");
        }
    }
}

fn is_health_verdict(state: MachineState) -> bool {
    matches!(
        state,
        MachineState::Running | MachineState::Degraded | MachineState::Error
    )
}
