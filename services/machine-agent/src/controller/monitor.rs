//! Liveness monitoring.
//!
//! The monitor never changes state itself. It turns what it sees into
//! `Healthcheck` events (and `ContainerStateChanged` for guest events) and
//! leaves debouncing to the controller's handler.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kiln_reconcile::{BackoffPolicy, MachineState};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ControllerCore;
use crate::event::MachineEvent;
use crate::providers::GuestEventClient;

/// First reconnect delay of the event-stream listener.
const LISTENER_BASE_BACKOFF: Duration = Duration::from_millis(50);

/// How a controller observes a machine's liveness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorStrategy {
    /// Round-trip a healthcheck to the guest every `interval`.
    Polling { interval: Duration },

    /// Hold a subscription to the guest's event stream. Any event counts as
    /// a successful healthcheck, a broken stream as a failed one.
    /// Reconnects back off up to `max_backoff`, each delay spread by
    /// `jitter` (0.0 to 1.0).
    EventStream { max_backoff: Duration, jitter: f64 },
}

impl Default for MonitorStrategy {
    fn default() -> Self {
        Self::Polling {
            interval: Duration::from_secs(2),
        }
    }
}

impl MonitorStrategy {
    /// Whether a machine in `state` is observed.
    ///
    /// Polling also covers `Error` so it can notice a recovery.
    pub fn observes(&self, state: MachineState) -> bool {
        match self {
            Self::Polling { .. } => matches!(
                state,
                MachineState::Starting
                    | MachineState::Running
                    | MachineState::Degraded
                    | MachineState::Error
            ),
            Self::EventStream { .. } => matches!(
                state,
                MachineState::Starting | MachineState::Running | MachineState::Degraded
            ),
        }
    }
}

pub(super) async fn run(core: Arc<ControllerCore>, cancel: CancellationToken) {
    match core.config.monitor {
        MonitorStrategy::Polling { interval } => poll(&core, interval, &cancel).await,
        MonitorStrategy::EventStream {
            max_backoff,
            jitter,
        } => {
            let Some(client) = core.providers.guest_events.clone() else {
                warn!(machine_id = %core.id, "No guest event client, listener not started");
                return;
            };
            let backoff =
                BackoffPolicy::capped(LISTENER_BASE_BACKOFF.min(max_backoff), max_backoff)
                    .with_jitter(jitter);
            listen(&core, client, backoff, &cancel).await
        }
    }
}

async fn poll(core: &ControllerCore, interval: Duration, cancel: &CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(machine_id = %core.id, interval_ms = interval.as_millis() as u64, "Health polling started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let event = match core.providers.runtime.healthcheck(core.id).await {
            Ok(()) => MachineEvent::healthy(),
            Err(e) => MachineEvent::unhealthy(e),
        };

        if cancel.is_cancelled() || core.bus.publish(event).is_err() {
            break;
        }
    }

    debug!(machine_id = %core.id, "Health polling stopped");
}

async fn listen(
    core: &ControllerCore,
    client: Arc<dyn GuestEventClient>,
    backoff: BackoffPolicy,
    cancel: &CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            subscribed = client.subscribe(core.id) => subscribed,
        };

        let error = match subscribed {
            Ok(mut stream) => {
                info!(machine_id = %core.id, "Guest event stream connected");
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };

                    match next {
                        Some(Ok(event)) => {
                            failures = 0;
                            debug!(
                                machine_id = %core.id,
                                container_id = %event.container_id,
                                state = ?event.state,
                                "Guest event received"
                            );
                            let forwarded = core
                                .bus
                                .publish(MachineEvent::ContainerStateChanged {
                                    container_id: event.container_id,
                                    state: event.state,
                                    exit_code: event.exit_code,
                                })
                                .and_then(|_| core.bus.publish(MachineEvent::healthy()));
                            if forwarded.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "guest event stream closed".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        if cancel.is_cancelled() {
            return;
        }

        let delay = backoff.delay(failures);
        failures = failures.saturating_add(1);
        warn!(
            machine_id = %core.id,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Guest event stream lost"
        );

        if core.bus.publish(MachineEvent::unhealthy(error)).is_err() {
            return;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(MachineState::Pending, false, false)]
    #[case(MachineState::Starting, true, true)]
    #[case(MachineState::Running, true, true)]
    #[case(MachineState::Degraded, true, true)]
    #[case(MachineState::Error, true, false)]
    #[case(MachineState::Terminating, false, false)]
    #[case(MachineState::Terminated, false, false)]
    fn test_observed_states(
        #[case] state: MachineState,
        #[case] polling: bool,
        #[case] events: bool,
    ) {
        let poll = MonitorStrategy::Polling {
            interval: Duration::from_secs(1),
        };
        let stream = MonitorStrategy::EventStream {
            max_backoff: Duration::from_secs(1),
            jitter: 0.2,
        };
        assert_eq!(poll.observes(state), polling);
        assert_eq!(stream.observes(state), events);
    }
}
