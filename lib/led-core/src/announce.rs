//! Two-phase announcement timer (spec §4.6, C6). Posts "announce now" to the
//! protocol handler at an initial rapid cadence, then settles into a steady
//! cadence after the first send. No jitter is required.

use std::time::{Duration, Instant};

pub struct AnnounceScheduler {
    steady: Duration,
    next_deadline: Instant,
}

impl AnnounceScheduler {
    pub fn new(initial: Duration, steady: Duration, now: Instant) -> AnnounceScheduler {
        AnnounceScheduler {
            steady,
            next_deadline: now + initial,
        }
    }

    /// Deadline the protocol loop should use as its readiness-wait timeout.
    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    /// True once `now` has reached the scheduled deadline.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_deadline
    }

    /// Call after the protocol handler has actually sent the announcement.
    /// The initial cadence only governs the very first deadline (set in
    /// [`AnnounceScheduler::new`]); every send after that, including the
    /// first, schedules the next one at the steady cadence.
    pub fn on_announced(&mut self, now: Instant) {
        self.next_deadline = now + self.steady;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_transitions_from_initial_to_steady() {
        let t0 = Instant::now();
        let mut sched = AnnounceScheduler::new(Duration::from_secs(1), Duration::from_secs(10), t0);

        assert!(!sched.is_due(t0));
        assert!(sched.is_due(t0 + Duration::from_secs(1)));

        sched.on_announced(t0 + Duration::from_secs(1));
        assert_eq!(sched.next_deadline(), t0 + Duration::from_secs(1) + Duration::from_secs(10));

        sched.on_announced(t0 + Duration::from_secs(11));
        assert_eq!(sched.next_deadline(), t0 + Duration::from_secs(21));
    }
}
