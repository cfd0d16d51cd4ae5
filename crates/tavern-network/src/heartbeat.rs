//! Liveness probing
//!
//! Distinguishes a silently dead session (transport still "open") from one that
//! is actually answering. Only a reply to the most recent probe that arrives
//! after that probe was sent counts as proof of life.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A probe in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub seq: u64,
    pub sent_at: Instant,
}

/// Outcome of polling the heartbeat clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPoll {
    Idle,
    SendProbe(Probe),
    TimedOut(Probe),
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_probe_at: Option<Instant>,
    outstanding: Option<Probe>,
    reply_deadline: Option<Instant>,
    seq: u64,
    alive: bool,
    last_reply_at: Option<Instant>,
    last_rtt: Option<Duration>,
}

impl Heartbeat {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_probe_at: None,
            outstanding: None,
            reply_deadline: None,
            seq: 0,
            alive: false,
            last_reply_at: None,
            last_rtt: None,
        }
    }

    /// Begin probing; the session is presumed alive until a probe goes unanswered
    pub fn start(&mut self, now: Instant) {
        self.alive = true;
        self.outstanding = None;
        self.reply_deadline = None;
        self.next_probe_at = Some(now + self.interval);
    }

    /// Cancel every heartbeat timer
    pub fn stop(&mut self) {
        self.alive = false;
        self.outstanding = None;
        self.reply_deadline = None;
        self.next_probe_at = None;
    }

    pub fn poll(&mut self, now: Instant) -> HeartbeatPoll {
        if let (Some(deadline), Some(probe)) = (self.reply_deadline, self.outstanding) {
            if now >= deadline {
                debug!("Probe {} unanswered after {:?}", probe.seq, self.timeout);
                self.stop();
                return HeartbeatPoll::TimedOut(probe);
            }
            return HeartbeatPoll::Idle;
        }

        match self.next_probe_at {
            Some(at) if now >= at => {
                self.seq += 1;
                let probe = Probe {
                    seq: self.seq,
                    sent_at: now,
                };
                self.outstanding = Some(probe);
                self.reply_deadline = Some(now + self.timeout);
                self.next_probe_at = Some(now + self.interval);
                trace!("Sending probe {}", probe.seq);
                HeartbeatPoll::SendProbe(probe)
            }
            _ => HeartbeatPoll::Idle,
        }
    }

    /// Record a reply; returns whether it was accepted
    pub fn on_reply(&mut self, seq: u64, received_at: Instant) -> bool {
        let Some(probe) = self.outstanding else {
            trace!("Ignoring unsolicited reply {}", seq);
            return false;
        };
        if probe.seq != seq || received_at < probe.sent_at {
            debug!("Ignoring stale reply {} (waiting for {})", seq, probe.seq);
            return false;
        }

        self.outstanding = None;
        self.reply_deadline = None;
        self.alive = true;
        self.last_reply_at = Some(received_at);
        self.last_rtt = Some(received_at - probe.sent_at);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.reply_deadline {
            Some(deadline) => Some(deadline),
            None => self.next_probe_at,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn last_reply_at(&self) -> Option<Instant> {
        self.last_reply_at
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}
