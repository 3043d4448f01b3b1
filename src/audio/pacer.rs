use std::time::Duration;

use tokio::time::Instant;

use super::FRAME_DURATION;

/// Frames of lag tolerated before the cadence is re-anchored to now.
pub const MAX_LAG_FRAMES: u32 = 10;

/// Fixed-cadence scheduler. Deadlines are computed from the anchor, never
/// from the previous wake-up, so a slow tick does not shift later ones.
#[derive(Debug)]
pub struct FramePacer {
    anchor: Instant,
    period: Duration,
    ticks: u32,
}

impl FramePacer {
    pub fn new() -> Self {
        Self::with_period(FRAME_DURATION)
    }

    pub fn with_period(period: Duration) -> Self {
        Self {
            anchor: Instant::now(),
            period,
            ticks: 0,
        }
    }

    pub fn next_deadline(&self) -> Instant {
        self.anchor + self.period * self.ticks
    }

    /// Sleep until the next slot. Returns immediately when behind schedule.
    pub async fn tick(&mut self) {
        let deadline = self.next_deadline();
        let now = Instant::now();
        if now > deadline + self.period * MAX_LAG_FRAMES {
            tracing::warn!(
                behind_ms = (now - deadline).as_millis() as u64,
                "audio pacing fell behind, re-anchoring"
            );
            self.restart();
        } else {
            tokio::time::sleep_until(deadline).await;
        }
        self.ticks = self.ticks.wrapping_add(1);
    }

    /// Start a fresh cadence from now.
    pub fn restart(&mut self) {
        self.anchor = Instant::now();
        self.ticks = 0;
    }
}

impl Default for FramePacer {
    fn default() -> Self {
        Self::new()
    }
}
