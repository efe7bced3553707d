//! Keep-alive tracking.
//!
//! The tracker remembers the configured interval, the time of the last
//! transmission and how many PINGREQs are still unanswered. The timer
//! thread pings on every elapsed window and declares the connection
//! dead once a second ping goes out with the first still unanswered.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Tracker {
    interval: Duration,
    last: Instant,
    pings: u8,
}

impl Tracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
            pings: 0,
        }
    }

    /// Record a transmission.
    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    /// Time left in the current keep-alive window; zero when elapsed.
    pub fn window(&self) -> Duration {
        self.interval.saturating_sub(self.last.elapsed())
    }

    /// Record a sent PINGREQ.
    pub fn ping(&mut self) {
        self.pings += 1;
    }

    /// Record a received PINGRESP.
    pub fn pong(&mut self) {
        self.pings = self.pings.saturating_sub(1);
    }

    /// Whether a ping is still unanswered.
    pub fn pending(&self) -> bool {
        self.pings > 0
    }

    /// Whether more than one ping is unanswered, meaning a full extra
    /// window elapsed without a PINGRESP.
    pub fn overdue(&self) -> bool {
        self.pings > 1
    }
}
