//! Heartbeat liveness protocol for the push channel.
//!
//! Runs only while the connection manager is `Connected`. Each probe tick
//! sends one `ping` and counts it as missed until any liveness response
//! (server heartbeat or pong) arrives. Enough consecutive misses declare the
//! connection dead even though the transport never reported a close — the
//! primary defense against half-open connections.

use std::time::Instant;

/// What the connection loop must do on a probe tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send one liveness probe.
    SendProbe,
    /// Missed-response threshold reached; treat the connection as dead.
    Dead,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    miss_threshold: u32,
    missed: u32,
    last_response_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(miss_threshold: u32) -> Self {
        Self {
            miss_threshold,
            missed: 0,
            last_response_at: None,
        }
    }

    /// Reset for a fresh connection.
    pub fn reset(&mut self) {
        self.missed = 0;
        self.last_response_at = None;
    }

    /// Called on every probe-interval tick. Each probe counts as missed
    /// until a response clears the counter.
    pub fn on_probe_tick(&mut self) -> HeartbeatAction {
        if self.missed >= self.miss_threshold {
            return HeartbeatAction::Dead;
        }
        self.missed += 1;
        HeartbeatAction::SendProbe
    }

    /// Any liveness response (explicit pong or implicit server heartbeat).
    pub fn record_response(&mut self) {
        self.missed = 0;
        self.last_response_at = Some(Instant::now());
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_response_at(&self) -> Option<Instant> {
        self.last_response_at
    }
}
