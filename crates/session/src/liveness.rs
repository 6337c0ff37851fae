//! Idle detection for tunnel links
//!
//! Two clocks per session: a heartbeat becomes due when nothing has been
//! *sent* for the idle threshold, and the link is considered stale when
//! nothing has been *received* for `timeout_multiple` idle thresholds.
//! Splitting the clocks keeps incoming peer heartbeats from suppressing our
//! own emission while still letting a silent peer expire.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The send side has been idle for the threshold; emit a heartbeat.
    HeartbeatDue,
    /// Nothing received for the full timeout; tear the session down.
    Expired,
}

#[derive(Debug)]
pub struct IdleTracker {
    idle: Duration,
    expiry: Duration,
    last_recv: Instant,
    last_send: Instant,
}

impl IdleTracker {
    pub fn new(idle: Duration, timeout_multiple: u32) -> Self {
        let now = Instant::now();
        Self {
            idle,
            expiry: idle * timeout_multiple.max(1),
            last_recv: now,
            last_send: now,
        }
    }

    /// Note traffic received from the peer (heartbeats included).
    pub fn record_recv(&mut self) {
        self.last_recv = Instant::now();
    }

    /// Note traffic sent toward the peer (heartbeats included).
    pub fn record_send(&mut self) {
        self.last_send = Instant::now();
    }

    /// The next instant at which `check` may report an event.
    pub fn deadline(&self) -> Instant {
        (self.last_send + self.idle).min(self.last_recv + self.expiry)
    }

    /// What, if anything, is due right now. Expiry wins over emission.
    pub fn check(&self) -> Option<IdleEvent> {
        let now = Instant::now();
        if now >= self.last_recv + self.expiry {
            Some(IdleEvent::Expired)
        } else if now >= self.last_send + self.idle {
            Some(IdleEvent::HeartbeatDue)
        } else {
            None
        }
    }
}
