//! Periodic background task with an explicit start/stop lifecycle.
//!
//! `start` is a no-op while running and `stop` may be called any number of
//! times.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Sweeper {
    name: &'static str,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Sweeper {
    #[must_use]
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop, calling `tick` once per interval. Must be called from
    /// inside a Tokio runtime.
    pub fn start<F, Fut>(&self, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if running.is_some() {
            debug!(sweeper = self.name, "sweeper already running");
            return;
        }

        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let name = self.name;
        let period = self.interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = child.cancelled() => {
                        debug!(sweeper = name, "sweeper stopping");
                        break;
                    }
                    _ = interval.tick() => tick().await,
                }
            }
        });

        info!(
            sweeper = self.name,
            interval_secs = self.interval.as_secs(),
            "sweeper started"
        );
        *running = Some(Running { cancel, handle });
    }

    /// Stop the loop. Safe to call when not running.
    pub fn stop(&self) {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(running) = taken {
            running.cancel.cancel();
            running.handle.abort();
            info!(sweeper = self.name, "sweeper stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
