use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Tracks a monotonic process start time so node uptime never goes backwards,
/// even if the wall clock is stepped.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    started_at: Instant,
}

impl Uptime {
    #[inline]
    pub fn start() -> Uptime {
        Uptime {
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
