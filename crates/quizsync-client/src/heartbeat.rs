//! Heartbeat ping/pong liveness tracking.
//!
//! The connection task owns one [`HeartbeatMonitor`] per connection and
//! drives it from a `tokio::time::interval`: each tick asks the monitor
//! what to do, each inbound pong marks the link alive. A tick that finds
//! the previous ping unanswered is a miss; `max_missed` consecutive misses
//! declare the link dead. `max_missed == 0` reports misses but never
//! declares death.

/// What the connection task should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Link is healthy; send the next ping.
    Ping,
    /// The previous ping went unanswered; report it and ping again.
    Missed {
        /// Consecutive misses so far.
        missed: u32,
    },
    /// Too many consecutive misses; tear the link down.
    Dead {
        /// Consecutive misses that triggered the verdict.
        missed: u32,
    },
}

/// Per-connection liveness state.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    missed: u32,
    awaiting_pong: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor. No ping is outstanding yet.
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            missed: 0,
            awaiting_pong: false,
        }
    }

    /// Record a pong (or any proof of liveness).
    pub fn mark_alive(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
    }

    /// Consecutive misses so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Evaluate one interval tick. Assumes the caller sends a ping unless
    /// the verdict is [`HeartbeatVerdict::Dead`].
    pub fn on_tick(&mut self) -> HeartbeatVerdict {
        let verdict = if self.awaiting_pong {
            self.missed += 1;
            if self.max_missed > 0 && self.missed >= self.max_missed {
                return HeartbeatVerdict::Dead {
                    missed: self.missed,
                };
            }
            HeartbeatVerdict::Missed {
                missed: self.missed,
            }
        } else {
            HeartbeatVerdict::Ping
        };
        // Not alive until the next pong
        self.awaiting_pong = true;
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_pings() {
        let mut hb = HeartbeatMonitor::new(3);
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Ping);
    }

    #[test]
    fn answered_pings_stay_healthy() {
        let mut hb = HeartbeatMonitor::new(3);
        for _ in 0..10 {
            assert_eq!(hb.on_tick(), HeartbeatVerdict::Ping);
            hb.mark_alive();
        }
        assert_eq!(hb.missed(), 0);
    }

    #[test]
    fn consecutive_misses_reach_dead() {
        let mut hb = HeartbeatMonitor::new(3);
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Ping);
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Missed { missed: 1 });
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Missed { missed: 2 });
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Dead { missed: 3 });
    }

    #[test]
    fn pong_resets_miss_count() {
        let mut hb = HeartbeatMonitor::new(2);
        let _ = hb.on_tick();
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Missed { missed: 1 });
        hb.mark_alive();
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Ping);
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Missed { missed: 1 });
    }

    #[test]
    fn zero_max_missed_never_dies() {
        let mut hb = HeartbeatMonitor::new(0);
        let _ = hb.on_tick();
        for n in 1..=50 {
            assert_eq!(hb.on_tick(), HeartbeatVerdict::Missed { missed: n });
        }
    }

    #[test]
    fn max_missed_one_dies_on_first_miss() {
        let mut hb = HeartbeatMonitor::new(1);
        let _ = hb.on_tick();
        assert_eq!(hb.on_tick(), HeartbeatVerdict::Dead { missed: 1 });
    }
}
