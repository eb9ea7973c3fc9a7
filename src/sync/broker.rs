//! Fan-out of change events to registered backends
//!
//! Every registered backend gets its own dispatcher task fed by an unbounded
//! channel, so [`SyncBroker::accept`] never waits on a backend. A dispatcher
//! spawns one delivery task per event; deliveries for the same path are
//! chained so they apply in submission order while unrelated paths proceed
//! concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::guard::{is_replay_needed, EchoGuard};
use super::Backend;
use crate::config::EngineConfig;
use crate::types::{BackendId, ChangeEvent, ChangeKind};

/// Accepted events between two sweeps of the echo cache
const PURGE_EVERY: u64 = 256;

struct Registration {
    backend: Arc<dyn Backend>,
    tx: mpsc::UnboundedSender<Arc<ChangeEvent>>,
}

/// Registry of backends and fan-out point for their changes
pub struct SyncBroker {
    backends: RwLock<HashMap<BackendId, Registration>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    echo: Arc<EchoGuard>,
    grace: chrono::Duration,
    accepting: AtomicBool,
    accepted: AtomicU64,
}

impl SyncBroker {
    /// Create a broker with the configured grace window and echo TTL
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_settings(config.grace_window(), config.echo_ttl())
    }

    pub fn with_settings(grace: chrono::Duration, echo_ttl: Duration) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            dispatchers: Mutex::new(Vec::new()),
            echo: Arc::new(EchoGuard::new(echo_ttl)),
            grace,
            accepting: AtomicBool::new(true),
            accepted: AtomicU64::new(0),
        }
    }

    /// Add a backend to the fan-out set
    ///
    /// Returns `false` if a backend with the same id is already registered.
    /// Must be called from within a Tokio runtime.
    pub fn register(&self, backend: Arc<dyn Backend>) -> bool {
        let id = backend.id();
        let mut backends = self.backends.write();
        if backends.contains_key(&id) {
            debug!(backend = backend.name(), "Backend already registered");
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch(
            Arc::clone(&backend),
            rx,
            Arc::clone(&self.echo),
            self.grace,
        ));
        self.dispatchers.lock().push(handle);

        info!(backend = backend.name(), %id, "Registered backend");
        backends.insert(id, Registration { backend, tx });
        true
    }

    /// Names of the registered backends
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .values()
            .map(|r| r.backend.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Fan `event` out to every backend except its origin
    ///
    /// Returns the number of backends the event was queued for. Never blocks
    /// on delivery.
    pub fn accept(&self, event: ChangeEvent) -> usize {
        if !self.accepting.load(Ordering::Acquire) {
            warn!(path = event.file().path(), "Broker is shut down, dropping change");
            return 0;
        }

        let origin = event.file().origin();
        info!(
            path = event.file().path(),
            kind = %event.kind(),
            origin = origin.name(),
            "Received change"
        );

        let origin_id = origin.id();
        let event = Arc::new(event);
        let mut queued = 0;
        {
            let backends = self.backends.read();
            for (id, registration) in backends.iter() {
                if *id == origin_id {
                    continue;
                }
                if registration.tx.send(Arc::clone(&event)).is_ok() {
                    queued += 1;
                } else {
                    warn!(
                        backend = registration.backend.name(),
                        "Dispatcher is gone, change not delivered"
                    );
                }
            }
        }

        if self.accepted.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY == PURGE_EVERY - 1 {
            let purged = self.echo.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired echo records");
            }
        }

        queued
    }

    /// Whether a change `backend` observed is the echo of a recent delivery
    pub fn is_echo(&self, backend: BackendId, path: &str, change: ChangeKind) -> bool {
        self.echo.is_echo(backend, path, change)
    }

    pub fn echo_guard(&self) -> &EchoGuard {
        &self.echo
    }

    /// Stop accepting changes and wait for queued deliveries to finish
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        // dropping the senders ends each dispatcher once its queue is drained
        let registrations = std::mem::take(&mut *self.backends.write());
        drop(registrations);

        let dispatchers = std::mem::take(&mut *self.dispatchers.lock());
        for handle in dispatchers {
            if let Err(e) = handle.await {
                error!(?e, "Dispatcher task failed");
            }
        }
        info!("Broker shut down");
    }
}

async fn dispatch(
    backend: Arc<dyn Backend>,
    mut rx: mpsc::UnboundedReceiver<Arc<ChangeEvent>>,
    echo: Arc<EchoGuard>,
    grace: chrono::Duration,
) {
    let mut lanes: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(event) = rx.recv().await {
        lanes.retain(|_, handle| !handle.is_finished());

        let path = event.file().path().to_string();
        let previous = lanes.remove(&path);
        let handle = tokio::spawn(deliver(
            Arc::clone(&backend),
            event,
            Arc::clone(&echo),
            grace,
            previous,
        ));
        lanes.insert(path, handle);
    }

    for (_, handle) in lanes {
        let _ = handle.await;
    }
    debug!(backend = backend.name(), "Dispatcher stopped");
}

async fn deliver(
    backend: Arc<dyn Backend>,
    event: Arc<ChangeEvent>,
    echo: Arc<EchoGuard>,
    grace: chrono::Duration,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        // a failed or panicked predecessor must not block this one
        let _ = previous.await;
    }

    let file = event.file();
    let counterpart = match backend.modified_at(file).await {
        Ok(counterpart) => counterpart,
        Err(e) => {
            warn!(
                backend = backend.name(),
                path = file.path(),
                error = %e,
                "Cannot inspect counterpart, dropping change"
            );
            return;
        }
    };

    if !is_replay_needed(file.kind(), file.modified_at(), counterpart, grace) {
        debug!(
            backend = backend.name(),
            path = file.path(),
            kind = %event.kind(),
            "Counterpart is up to date, ignoring change"
        );
        return;
    }

    echo.record(backend.id(), file.path());
    match backend.apply(&event).await {
        Ok(()) => {
            // the write may outlast the TTL; restart it from completion
            echo.record(backend.id(), file.path());
            debug!(backend = backend.name(), path = file.path(), kind = %event.kind(), "Applied change");
        }
        Err(e) if e.is_fatal() => {
            error!(backend = backend.name(), path = file.path(), error = %e, "Refused change");
        }
        Err(e) => {
            warn!(backend = backend.name(), path = file.path(), error = %e, "Failed to apply change");
        }
    }
}
