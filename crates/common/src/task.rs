//! Periodic background tasks with a cooperative shutdown hook.
//!
//! Relay, consumer, dead-letter reconciliation, retention and payment
//! reconciliation all run as independent tasks off the request path. Each one
//! is driven by [`spawn_periodic`] and stops after its current cycle once the
//! shared [`ShutdownTrigger`] fires.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Sending half of the shutdown signal. Held by the process entry point.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half of the shutdown signal, cloned into every background task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl ShutdownTrigger {
    /// Creates a new trigger in the "running" state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns a new receiver for this trigger.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// Signals every subscribed task to stop.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Returns true once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested or the trigger is dropped.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawns `tick` on a fixed interval until `shutdown` fires.
///
/// The first tick runs immediately. A slow tick delays the next one rather
/// than bursting to catch up, and a tick in progress is never interrupted.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: Shutdown,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    // `interval` panics on a zero period.
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(task = name, period_ms = period.as_millis() as u64, "background task started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => break,
                _ = interval.tick() => tick().await,
            }
        }

        tracing::info!(task = name, "background task stopped");
    })
}
