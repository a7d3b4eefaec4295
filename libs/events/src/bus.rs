//! The event bus and its dispatch loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::BusError;

type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type HandlerMap<E> = RwLock<HashMap<u64, Handler<E>>>;

/// An event tagged with its publish sequence number.
struct Sequenced<E> {
    seq: u64,
    event: E,
}

/// Dispatch progress, observed by [`EventBus::settled`].
#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    /// Sequence number of the last fully dispatched event.
    dispatched: u64,
    /// Set once the dispatch loop has exited.
    closed: bool,
}

/// Publish/subscribe bus for events of type `E`.
pub struct EventBus<E> {
    /// Name used in log lines.
    name: String,

    /// Last assigned sequence number. Held while sending so that sequence
    /// order and queue order agree across concurrent publishers.
    seq: Mutex<u64>,

    tx: mpsc::UnboundedSender<Sequenced<E>>,

    /// Taken by `start`.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Sequenced<E>>>>,

    handlers: Arc<HandlerMap<E>>,

    next_handler_id: AtomicU64,

    progress: Arc<watch::Sender<Progress>>,
}

impl<E> EventBus<E>
where
    E: Clone + Send + 'static,
{
    /// Create a bus. Nothing is dispatched until [`EventBus::start`].
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (progress, _) = watch::channel(Progress::default());

        Self {
            name: name.into(),
            seq: Mutex::new(0),
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_handler_id: AtomicU64::new(0),
            progress: Arc::new(progress),
        }
    }

    /// Queue an event for dispatch and return its sequence number.
    ///
    /// Never waits for handlers.
    pub fn publish(&self, event: E) -> Result<u64, BusError> {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        let next = *seq + 1;
        self.tx
            .send(Sequenced { seq: next, event })
            .map_err(|_| BusError::Closed)?;
        *seq = next;
        Ok(next)
    }

    /// Register a handler, invoked once for every event dispatched after
    /// this call returns.
    pub fn subscribe<F, Fut>(&self, handler: F) -> Subscription<E>
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let handler: Handler<E> = Arc::new(move |event| handler(event).boxed());

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handler);

        debug!(bus = %self.name, handler_id = id, "Handler subscribed");

        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait until the event with sequence `seq` has been dispatched to all
    /// handlers.
    ///
    /// Returns `BusError::Closed` if the loop shut down first. Must not be
    /// awaited from inside a handler of this bus: the loop is waiting on
    /// that handler and the event can never settle.
    pub async fn settled(&self, seq: u64) -> Result<(), BusError> {
        let mut rx = self.progress.subscribe();
        let progress = rx
            .wait_for(|p| p.dispatched >= seq || p.closed)
            .await
            .map_err(|_| BusError::Closed)?;

        if progress.dispatched >= seq {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    /// True once the dispatch loop has exited.
    pub fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    /// Spawn the dispatch loop. It runs until `lifecycle` is cancelled.
    pub fn start(&self, lifecycle: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BusError::AlreadyStarted)?;

        let name = self.name.clone();
        let handlers = Arc::clone(&self.handlers);
        let progress = Arc::clone(&self.progress);

        Ok(tokio::spawn(run_dispatch_loop(
            name, rx, handlers, progress, lifecycle,
        )))
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self
            .handlers
            .read()
            .map(|h| h.len())
            .unwrap_or_default();
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("handlers", &handlers)
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it leaves the handler registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription<E> {
    id: u64,
    handlers: Weak<HandlerMap<E>>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deregister the handler. Returns false if it was already gone or the
    /// bus has been dropped.
    pub fn unsubscribe(self) -> bool {
        let Some(handlers) = self.handlers.upgrade() else {
            return false;
        };
        let removed = handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id)
            .is_some();
        removed
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

async fn run_dispatch_loop<E>(
    name: String,
    mut rx: mpsc::UnboundedReceiver<Sequenced<E>>,
    handlers: Arc<HandlerMap<E>>,
    progress: Arc<watch::Sender<Progress>>,
    lifecycle: CancellationToken,
) where
    E: Clone + Send + 'static,
{
    debug!(bus = %name, "Dispatch loop started");

    loop {
        let next = tokio::select! {
            biased;

            _ = lifecycle.cancelled() => break,
            next = rx.recv() => next,
        };

        let Some(Sequenced { seq, event }) = next else {
            break;
        };

        let snapshot: Vec<Handler<E>> = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let calls = snapshot.into_iter().map(|handler| {
            let event = event.clone();
            AssertUnwindSafe(async move { handler(event).await }).catch_unwind()
        });

        for result in join_all(calls).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(bus = %name, seq, error = %e, "Event handler failed");
                }
                Err(_) => {
                    error!(bus = %name, seq, "Event handler panicked");
                }
            }
        }

        progress.send_modify(|p| p.dispatched = seq);
    }

    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    progress.send_modify(|p| p.closed = true);

    debug!(bus = %name, discarded, "Dispatch loop stopped");
}
