//! Confirmed position and status-update deadline for a replication session.
//!
//! Pure state: the session loop feeds it the current time and the
//! positions it has consumed, and asks it when the next standby status
//! update is due.

use std::time::Duration;

use tokio::time::Instant;

use super::lsn::Lsn;

/// Default interval between standby status updates.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PositionTracker {
    confirmed: Lsn,
    next_deadline: Instant,
}

impl PositionTracker {
    pub fn new(start: Lsn, now: Instant, interval: Duration) -> Self {
        Self {
            confirmed: start,
            next_deadline: now + interval,
        }
    }

    /// Move the confirmed position forward to `position`.
    ///
    /// Returns false when `position` is not ahead of the confirmed one; the
    /// confirmed position never moves backwards.
    pub fn advance(&mut self, position: Lsn) -> bool {
        if position > self.confirmed {
            self.confirmed = position;
            true
        } else {
            false
        }
    }

    pub fn confirmed(&self) -> Lsn {
        self.confirmed
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    pub fn due_for_status_update(&self, now: Instant) -> bool {
        now >= self.next_deadline
    }

    pub fn on_status_sent(&mut self, now: Instant, interval: Duration) {
        self.next_deadline = now + interval;
    }

    /// The server asked for a reply: make the next loop iteration send one.
    pub fn request_immediate_update(&mut self, now: Instant) {
        self.next_deadline = now;
    }
}
