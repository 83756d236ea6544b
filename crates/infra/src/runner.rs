//! Periodic service loops.
//!
//! Producer, dispatcher and reaper each run on their own OS thread with an
//! independent timer. A stop request interrupts the wait between cycles; a
//! cycle in progress always finishes.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::CycleError;
use crate::retry::RetryPolicy;

/// One cycle of a periodic service.
pub trait PeriodicTask: Send + 'static {
    fn name(&self) -> &'static str;

    fn tick(&self) -> Result<(), CycleError>;
}

/// Liveness of a service loop.
///
/// Goes down after `unavailable_threshold` consecutive transient store
/// failures and comes back with the next successful cycle.
#[derive(Debug, Clone)]
pub struct Health {
    live: Arc<AtomicBool>,
    consecutive_failures: Arc<AtomicU32>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Health {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn record_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        !self.live.swap(true, Ordering::SeqCst)
    }

    fn record_unavailable(&self, threshold: u32) -> (u32, bool) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let went_down = failures >= threshold && self.live.swap(false, Ordering::SeqCst);
        (failures, went_down)
    }
}

/// Timing of a periodic loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Wait between successful cycles.
    pub interval: Duration,
    /// Backoff applied after transient store failures.
    pub backoff: RetryPolicy,
    /// Consecutive transient failures before the loop reports not-live.
    pub unavailable_threshold: u32,
}

impl LoopSettings {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            backoff: RetryPolicy::exponential(u32::MAX, Duration::from_millis(500), Duration::from_secs(30)),
            unavailable_threshold: 5,
        }
    }
}

/// Handle to control and join a service loop.
#[derive(Debug)]
pub struct ServiceHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    health: Health,
}

impl ServiceHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn health(&self) -> Health {
        self.health.clone()
    }

    /// Request graceful shutdown and wait for the current cycle to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!(service = self.name, "service thread panicked");
            }
        }
    }
}

/// Spawn `task` on a named thread, running one cycle per interval.
pub fn spawn_periodic<T: PeriodicTask>(task: T, settings: LoopSettings) -> io::Result<ServiceHandle> {
    let name = task.name();
    let health = Health::default();
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let loop_health = health.clone();
    let join = thread::Builder::new()
        .name(format!("cadence-{name}"))
        .spawn(move || service_loop(task, settings, shutdown_rx, loop_health))?;

    Ok(ServiceHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
        health,
    })
}

fn service_loop<T: PeriodicTask>(
    task: T,
    settings: LoopSettings,
    shutdown_rx: mpsc::Receiver<()>,
    health: Health,
) {
    let name = task.name();
    info!(service = name, interval_ms = settings.interval.as_millis() as u64, "service started");

    loop {
        let wait = match task.tick() {
            Ok(()) => {
                if health.record_success() {
                    info!(service = name, "store reachable again, service live");
                }
                settings.interval
            }
            Err(e) if e.is_transient() => {
                let (failures, went_down) = health.record_unavailable(settings.unavailable_threshold);
                let delay = settings.backoff.delay_after(failures, name);
                if went_down {
                    error!(service = name, failures, error = %e, "store unavailable, service not live");
                } else {
                    warn!(
                        service = name,
                        failures,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "cycle failed on unavailable store"
                    );
                }
                delay
            }
            Err(e) => {
                // The store answered, so the loop is live even though the cycle failed.
                health.record_success();
                warn!(service = name, error = %e, "cycle failed");
                settings.interval
            }
        };

        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => debug!(service = name, "next cycle"),
        }
    }

    info!(service = name, "service stopped");
}
