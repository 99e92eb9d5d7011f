//! Node adoption state and monotonically increasing health counters
//! (spec §3, C5). Owned exclusively by the protocol thread; the output
//! worker never mutates this directly (spec §5) and reports failures back
//! through acks instead.

use led_wire::time::Uptime;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HostIdentity {
    pub mac: [u8; 6],
    pub ipv4: Ipv4Addr,
    pub hostname: String,
}

impl Default for HostIdentity {
    fn default() -> HostIdentity {
        HostIdentity {
            mac: [0; 6],
            ipv4: Ipv4Addr::UNSPECIFIED,
            hostname: String::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub bad_crc: u64,
    pub frames_dropped_no_mem: u64,
    pub frames_dropped_not_adopted: u64,
    pub sync_dropped: u64,
}

pub struct NodeState {
    pub adopted: bool,
    last_controller_msg_at: Instant,
    pub counters: Counters,
    pub identity: HostIdentity,
    uptime: Uptime,
}

impl NodeState {
    pub fn new(identity: HostIdentity) -> NodeState {
        NodeState {
            adopted: false,
            last_controller_msg_at: Instant::now(),
            counters: Counters::default(),
            identity,
            uptime: Uptime::start(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.uptime.elapsed_secs()
    }

    /// Records that a datagram was received from the controller, resetting
    /// the keepalive-expiry clock.
    pub fn note_controller_contact(&mut self, now: Instant) {
        self.last_controller_msg_at = now;
    }

    pub fn adopt(&mut self, now: Instant) {
        self.adopted = true;
        self.last_controller_msg_at = now;
    }

    /// Runs the silence check against `keepalive_timeout`; returns true if
    /// the node transitioned from adopted back to unadopted (spec §4.4 node
    /// state machine).
    pub fn expire_if_silent(&mut self, now: Instant, keepalive_timeout: Duration) -> bool {
        if self.adopted && now.duration_since(self.last_controller_msg_at) > keepalive_timeout {
            self.adopted = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_past_timeout_reverts_to_unadopted() {
        let mut state = NodeState::new(HostIdentity::default());
        let t0 = Instant::now();
        state.adopt(t0);

        assert!(!state.expire_if_silent(t0 + Duration::from_millis(10), Duration::from_secs(5)));
        assert!(state.adopted);

        assert!(state.expire_if_silent(t0 + Duration::from_secs(6), Duration::from_secs(5)));
        assert!(!state.adopted);
    }

    #[test]
    fn contact_resets_the_silence_clock() {
        let mut state = NodeState::new(HostIdentity::default());
        let t0 = Instant::now();
        state.adopt(t0);
        state.note_controller_contact(t0 + Duration::from_secs(4));

        assert!(!state.expire_if_silent(t0 + Duration::from_secs(8), Duration::from_secs(5)));
    }
}
