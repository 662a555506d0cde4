// =============================================================================
// Worker — one background Tokio task per component
// =============================================================================
//
// Lifecycle:
//   Idle  --start()-->  Running  --stop()-->  Idle
//
// `start` while running is a no-op that returns `false`; `stop` while idle is
// a no-op that returns `false`. `stop` signals the loop through a watch
// channel and waits at most `timeout` for it to exit, aborting the task if it
// does not.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stop flag handed to a worker loop.
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// True once stop was requested (or the owning worker is gone).
    pub fn is_set(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Sleep for `duration`, waking early if stop is requested.
    pub async fn sleep(&mut self, duration: Duration) {
        if self.is_set() {
            return;
        }
        tokio::select! {
            _ = self.rx.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns at most one running background task.
pub struct Worker {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl Worker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn the loop built by `make_loop`. Returns `false` when a loop is
    /// already running or no Tokio runtime is available.
    pub fn start<F, Fut>(&self, make_loop: F) -> bool
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.running.lock();
        if let Some(running) = slot.as_ref() {
            if !running.handle.is_finished() {
                debug!(worker = self.name, "start ignored: already running");
                return false;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(worker = self.name, error = %e, "cannot start worker outside a Tokio runtime");
                return false;
            }
        };

        let (stop_tx, rx) = watch::channel(false);
        let handle = runtime.spawn(make_loop(StopSignal { rx }));
        *slot = Some(Running { stop_tx, handle });

        info!(worker = self.name, "worker started");
        true
    }

    /// Signal the loop to stop and wait up to `timeout` for it to exit.
    /// Returns `false` when nothing was running.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let running = self.running.lock().take();
        let Some(Running { stop_tx, mut handle }) = running else {
            debug!(worker = self.name, "stop ignored: not running");
            return false;
        };

        // A send error only means the loop already exited.
        let _ = stop_tx.send(true);

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!(worker = self.name, "worker stopped"),
            Ok(Err(e)) => warn!(worker = self.name, error = %e, "worker exited abnormally"),
            Err(_) => {
                handle.abort();
                warn!(
                    worker = self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time, aborted"
                );
            }
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}
