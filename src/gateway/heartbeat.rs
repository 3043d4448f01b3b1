use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// How long to wait for HELLO after the socket opens.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPhase {
    Idle,
    Active { pending: bool },
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged.
    Failed,
    /// Monitor is idle or already failed; nothing to do.
    Ignored,
}

/// Liveness tracking for one connection. Time is passed in by the caller so
/// the state machine can be driven by a fake clock.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    phase: HeartbeatPhase,
    last_sent: Option<Instant>,
    last_ack_received: bool,
    latency: Option<Duration>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            interval: Duration::ZERO,
            phase: HeartbeatPhase::Idle,
            last_sent: None,
            last_ack_received: false,
            latency: None,
        }
    }

    /// Session established; `interval` comes from the remote HELLO.
    pub fn start(&mut self, interval: Duration) {
        self.interval = interval;
        self.phase = HeartbeatPhase::Active { pending: false };
        self.last_sent = None;
        self.last_ack_received = false;
        self.latency = None;
    }

    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        match self.phase {
            HeartbeatPhase::Active { pending: true } => {
                self.phase = HeartbeatPhase::Failed;
                TickOutcome::Failed
            }
            HeartbeatPhase::Active { pending: false } => {
                self.phase = HeartbeatPhase::Active { pending: true };
                self.last_sent = Some(now);
                self.last_ack_received = false;
                TickOutcome::Send
            }
            HeartbeatPhase::Idle | HeartbeatPhase::Failed => TickOutcome::Ignored,
        }
    }

    /// The remote side asked for a heartbeat out of cadence.
    pub fn on_request(&mut self, now: Instant) -> TickOutcome {
        match self.phase {
            HeartbeatPhase::Active { .. } => {
                self.phase = HeartbeatPhase::Active { pending: true };
                self.last_sent = Some(now);
                self.last_ack_received = false;
                TickOutcome::Send
            }
            _ => TickOutcome::Ignored,
        }
    }

    pub fn on_ack(&mut self, now: Instant) {
        if let HeartbeatPhase::Active { .. } = self.phase {
            self.phase = HeartbeatPhase::Active { pending: false };
            self.last_ack_received = true;
            self.latency = self.last_sent.map(|sent| now.saturating_duration_since(sent));
        }
    }

    pub fn stop(&mut self) {
        self.phase = HeartbeatPhase::Idle;
    }

    pub fn phase(&self) -> HeartbeatPhase {
        self.phase
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_ack_received(&self) -> bool {
        self.last_ack_received
    }

    /// Round trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}

/// Delay before the first heartbeat: a random fraction of the interval.
pub fn first_beat_delay(interval: Duration, jitter: f64) -> Duration {
    interval.mul_f64(jitter.clamp(0.0, 1.0))
}

/// Timer task that emits a tick every interval, first one jittered. Aborted on
/// drop so tearing down a connection cancels it.
pub struct HeartbeatTimer {
    handle: JoinHandle<()>,
}

impl HeartbeatTimer {
    pub fn spawn(interval: Duration, tx: mpsc::Sender<Instant>) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let first = Instant::now() + first_beat_delay(interval, rand::random::<f64>());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let at = ticker.tick().await;
                if tx.send(at).await.is_err() {
                    break;
                }
            }
        });

        Self { handle }
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
