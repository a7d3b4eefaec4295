//! Single-flight, cancellable background tasks.

use std::fmt::Debug;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of [`TaskSlot::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// No task was running; a new one was spawned.
    Started,
    /// A task toward the same key is still running; nothing was spawned.
    AlreadyRunning,
    /// A task toward a different key was cancelled and replaced.
    Superseded,
}

struct ActiveTask<K> {
    key: K,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl<K> ActiveTask<K> {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Holds at most one running background task, keyed by what it works toward.
///
/// Starting a task with the key of the one already running is a no-op.
/// Starting with a different key cancels the running task, and the new task
/// does not begin until the cancelled one has returned. Cancellation is
/// cooperative: the task receives a [`CancellationToken`] and is expected to
/// check it between steps.
pub struct TaskSlot<K> {
    name: &'static str,
    active: Mutex<Option<ActiveTask<K>>>,
}

impl<K> TaskSlot<K>
where
    K: Copy + PartialEq + Debug + Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            active: Mutex::new(None),
        }
    }

    /// Spawn `task` toward `key` unless an identical task is in flight.
    ///
    /// The task's token is a child of `parent`, so cancelling `parent` also
    /// stops it.
    pub fn start<F, Fut>(&self, key: K, parent: &CancellationToken, task: F) -> StartOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = match active.take() {
            Some(current) if current.is_running() && current.key == key => {
                *active = Some(current);
                return StartOutcome::AlreadyRunning;
            }
            Some(current) if current.is_running() => {
                debug!(
                    slot = self.name,
                    from = ?current.key,
                    to = ?key,
                    "Superseding running task"
                );
                current.cancel.cancel();
                Some(current.handle)
            }
            _ => None,
        };

        let outcome = if previous.is_some() {
            StartOutcome::Superseded
        } else {
            StartOutcome::Started
        };

        let cancel = parent.child_token();
        let work = task(cancel.clone());
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                // Never overlap with the task being replaced.
                let _ = previous.await;
            }
            work.await;
        });

        *active = Some(ActiveTask {
            key,
            started_at: Utc::now(),
            cancel,
            handle,
        });

        outcome
    }

    /// Cancel the running task, if any, and hand back its join handle so the
    /// caller can wait for it to wind down.
    pub fn cancel(&self) -> Option<JoinHandle<()>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let current = active.take()?;
        current.cancel.cancel();
        if current.is_running() {
            Some(current.handle)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ActiveTask::is_running)
    }

    /// Key of the running task.
    pub fn active_key(&self) -> Option<K> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|task| task.is_running())
            .map(|task| task.key)
    }

    /// When the running task was started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|task| task.is_running())
            .map(|task| task.started_at)
    }
}

impl<K: Debug> Debug for TaskSlot<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSlot").field("name", &self.name).finish()
    }
}
