//! Coalesces bursts of deltas into at most one render per interval.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RenderThrottle {
    min_interval: Duration,
    last_render: Option<Instant>,
    pending: bool,
}

impl RenderThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_render: None,
            pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.last_render = None;
        self.pending = false;
    }

    /// Records new data. Returns `true` if the caller should render now;
    /// otherwise the render is deferred until [`deadline`](Self::deadline).
    pub fn on_data(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.mark_rendered(now);
            true
        } else {
            self.pending = true;
            false
        }
    }

    /// Returns `true` if a deferred render is due at `now`.
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if self.pending && self.is_due(now) {
            self.mark_rendered(now);
            true
        } else {
            false
        }
    }

    /// When the next deferred render should happen, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.pending {
            return None;
        }
        Some(match self.last_render {
            Some(last) => last + self.min_interval,
            None => Instant::now(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Records a render that bypassed the throttle.
    pub fn mark_rendered(&mut self, now: Instant) {
        self.last_render = Some(now);
        self.pending = false;
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_render {
            Some(last) => now.duration_since(last) >= self.min_interval,
            None => true,
        }
    }
}
