//! Daemon lifecycle: phase tracking, the idle timer, and the one-shot shutdown signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Ready,
    /// Listening with nothing in flight; the idle timer is running.
    IdleArmed,
    ShuttingDown,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::IdleArmed => "idle",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    StopRequest,
    IdleTimeout,
    Signal(&'static str),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopRequest => f.write_str("stop request"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Signal(name) => write!(f, "signal {name}"),
        }
    }
}

pub struct Lifecycle {
    phase: Mutex<Phase>,
    last_activity: Mutex<Instant>,
    idle_timeout: Duration,
    stopping: AtomicBool,
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
}

impl Lifecycle {
    pub fn new(idle_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            phase: Mutex::new(Phase::Starting),
            last_activity: Mutex::new(Instant::now()),
            idle_timeout,
            stopping: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, next: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Moves `from` to `to` only if the current phase is `from`.
    fn transition(&self, from: Phase, to: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == from {
            *phase = to;
        }
    }

    pub fn mark_listening(&self) {
        self.transition(Phase::Starting, Phase::IdleArmed);
        self.touch();
    }

    /// Records activity and rearms the idle timer.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn request_started(&self) {
        self.touch();
        self.transition(Phase::IdleArmed, Phase::Ready);
    }

    pub fn request_finished(&self, still_active: bool) {
        self.touch();
        if !still_active {
            self.transition(Phase::Ready, Phase::IdleArmed);
        }
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.idle_timeout.is_zero() {
            return None;
        }
        Some(*self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) + self.idle_timeout)
    }

    /// Returns true for the caller that actually starts the shutdown.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(%reason, "shutting down");
        self.set_phase(Phase::ShuttingDown);
        self.shutdown_tx.send_replace(Some(reason));
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.shutdown_tx.subscribe()
    }

    pub fn mark_stopped(&self) {
        self.set_phase(Phase::Stopped);
    }

    /// Resolves once shutdown was requested, with the reason.
    pub async fn stopped(&self) -> ShutdownReason {
        let mut rx = self.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::StopRequest;
            }
        }
    }

    /// Requests shutdown once the idle deadline passes with `busy()` false. Returns
    /// immediately when idle shutdown is disabled.
    pub async fn watch_idle(&self, busy: impl Fn() -> bool) {
        let mut rx = self.subscribe();
        loop {
            let Some(deadline) = self.idle_deadline() else {
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let Some(current) = self.idle_deadline() else { return };
                    if current > Instant::now() {
                        continue;
                    }
                    if busy() {
                        // In-flight work keeps the daemon alive; look again one interval later.
                        self.touch();
                        continue;
                    }
                    self.request_shutdown(ShutdownReason::IdleTimeout);
                    return;
                }
                changed = rx.changed() => {
                    if changed.is_err() || rx.borrow().is_some() {
                        return;
                    }
                }
            }
        }
    }
}
