//! Connection lifecycle management
//!
//! A synchronous state machine that owns the single logical connection's
//! state, its heartbeat and its reconnection schedule. It performs no I/O: the
//! driver feeds it events with the current time and carries out the returned
//! [`LifecycleAction`]s.
//!
//! ```text
//! Disconnected --connect--> Connecting --welcome--> Connected
//!      ^                       |   ^                   |
//!      |                 fail  v   | backoff           | abnormal close / probe timeout
//!      +--clean close--- Reconnecting <----------------+
//!                              |
//!            budget spent / access denied --> Failed
//! ```

use crate::backoff::BackoffConfig;
use crate::heartbeat::{Heartbeat, HeartbeatPoll};
use std::fmt;
use std::time::Duration;
use tavern_protocol::close::{CLOSE_ABNORMAL, CLOSE_HEARTBEAT_TIMEOUT};
use tavern_protocol::envelope::timestamp_micros;
use tavern_protocol::{CloseReason, Envelope};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle timing configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Time between liveness probes
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered
    pub heartbeat_timeout: Duration,
    /// Budget for opening the transport and completing the handshake
    pub connect_timeout: Duration,
    /// Reconnection policy
    pub backoff: BackoffConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Why the manager stopped for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalFailure {
    /// The authority excluded this participant
    Rejected(CloseReason),
    /// The reconnection budget ran out
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for TerminalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalFailure::Rejected(reason) => write!(f, "rejected by server: {}", reason),
            TerminalFailure::RetriesExhausted { attempts } => {
                write!(f, "gave up after {} reconnection attempts", attempts)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(TerminalFailure),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

/// Transitions announced to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(Option<CloseReason>),
    Timeout,
}

/// Work the driver must carry out
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleAction {
    /// Open a new transport session and send `hello`
    OpenLink,
    /// Abandon the current link (or in-flight connect attempt)
    DropLink(CloseReason),
    /// Transmit a liveness probe
    SendPing(Envelope),
    /// The session became viable: drain pending sends
    FlushQueues,
}

pub struct ConnectionManager {
    config: LifecycleConfig,
    state: ConnectionState,
    heartbeat: Heartbeat,
    attempts: u32,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    events: Vec<ConnectionEvent>,
    session_id: Option<String>,
}

impl ConnectionManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let heartbeat = Heartbeat::new(config.heartbeat_interval, config.heartbeat_timeout);
        Self {
            config,
            state: ConnectionState::Disconnected,
            heartbeat,
            attempts: 0,
            connect_deadline: None,
            reconnect_at: None,
            events: Vec::new(),
            session_id: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Reconnection attempts since the last successful handshake
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Session id granted by the last `welcome`, offered again on reconnect
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Connected, answering probes, and the transport reports open
    pub fn is_connected(&self, link_open: bool) -> bool {
        self.can_send() && link_open
    }

    /// Whether envelopes may be handed to the link right now
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected && self.heartbeat.is_alive()
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Take the transitions recorded since the last call
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Explicit connect request
    pub fn connect(&mut self, now: Instant) -> Vec<LifecycleAction> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
            ConnectionState::Reconnecting => {
                // Skip the remaining backoff, keep the attempt count
                self.begin_connecting(now)
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                self.attempts = 0;
                self.begin_connecting(now)
            }
        }
    }

    /// Explicit disconnect: cancels every timer, no reconnection
    pub fn disconnect(&mut self) -> Vec<LifecycleAction> {
        let was_active = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        );
        self.cancel_timers();
        self.attempts = 0;
        if !was_active {
            return Vec::new();
        }
        info!("Disconnecting");
        self.transition(ConnectionState::Disconnected);
        self.events.push(ConnectionEvent::Disconnected(None));
        vec![LifecycleAction::DropLink(CloseReason::normal())]
    }

    /// A transport session opened; returns whether the driver should keep it
    ///
    /// The session is not viable until `welcome` arrives, so the connect
    /// deadline keeps running.
    pub fn on_link_opened(&mut self, _now: Instant) -> bool {
        if self.state != ConnectionState::Connecting {
            debug!("Discarding link opened in state {:?}", self.state);
            return false;
        }
        debug!("Link open, awaiting welcome");
        true
    }

    /// The authority accepted our `hello`
    pub fn on_handshake(&mut self, now: Instant, welcome: &Envelope) -> Vec<LifecycleAction> {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring welcome in state {:?}", self.state);
            return Vec::new();
        }
        if let Some(id) = welcome.str_field("session_id") {
            self.session_id = Some(id.to_string());
        }
        self.connect_deadline = None;
        self.attempts = 0;
        self.heartbeat.start(now);
        info!("Connected (session {:?})", self.session_id);
        self.transition(ConnectionState::Connected);
        self.events.push(ConnectionEvent::Connected);
        vec![LifecycleAction::FlushQueues]
    }

    /// The transport could not be opened
    pub fn on_connect_failed(&mut self, now: Instant, error: &str) -> Vec<LifecycleAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        warn!("Connect attempt failed: {}", error);
        self.connect_deadline = None;
        self.schedule_reconnect(now)
    }

    /// The link closed underneath us
    pub fn on_closed(&mut self, now: Instant, reason: CloseReason) -> Vec<LifecycleAction> {
        match self.state {
            ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Failed(_) => return Vec::new(),
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        let was_connected = self.state == ConnectionState::Connected;
        self.cancel_timers();

        if reason.is_authorization_denied() {
            warn!("Access denied by server: {}", reason);
            self.transition(ConnectionState::Failed(TerminalFailure::Rejected(reason.clone())));
            self.events.push(ConnectionEvent::Disconnected(Some(reason)));
            return Vec::new();
        }

        if was_connected {
            self.events.push(ConnectionEvent::Disconnected(Some(reason.clone())));
        }

        if reason.is_clean() && was_connected {
            info!("Server closed the session: {}", reason);
            self.transition(ConnectionState::Disconnected);
            return Vec::new();
        }

        warn!("Link lost: {}", reason);
        self.schedule_reconnect(now)
    }

    /// A `pong` arrived; returns whether it proved liveness
    pub fn on_pong(&mut self, now: Instant, pong: &Envelope) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        match pong.u64_field("seq") {
            Some(seq) => self.heartbeat.on_reply(seq, now),
            None => false,
        }
    }

    /// Fire any timers that are due
    pub fn poll(&mut self, now: Instant) -> Vec<LifecycleAction> {
        match self.state {
            ConnectionState::Connecting => match self.connect_deadline {
                Some(deadline) if now >= deadline => {
                    warn!("Handshake timed out after {:?}", self.config.connect_timeout);
                    self.connect_deadline = None;
                    let mut actions = vec![LifecycleAction::DropLink(CloseReason::new(
                        CLOSE_ABNORMAL,
                        "handshake timed out",
                    ))];
                    actions.extend(self.schedule_reconnect(now));
                    actions
                }
                _ => Vec::new(),
            },
            ConnectionState::Reconnecting => match self.reconnect_at {
                Some(at) if now >= at => self.begin_connecting(now),
                _ => Vec::new(),
            },
            ConnectionState::Connected => match self.heartbeat.poll(now) {
                HeartbeatPoll::Idle => Vec::new(),
                HeartbeatPoll::SendProbe(probe) => vec![LifecycleAction::SendPing(Envelope::ping(
                    probe.seq,
                    timestamp_micros(),
                ))],
                HeartbeatPoll::TimedOut(probe) => {
                    let silent_for = self
                        .heartbeat
                        .last_reply_at()
                        .map(|at| now.saturating_duration_since(at));
                    warn!(
                        "Liveness probe {} timed out (last pong {:?} ago), forcing reconnect",
                        probe.seq, silent_for
                    );
                    self.events.push(ConnectionEvent::Timeout);
                    self.events.push(ConnectionEvent::Disconnected(None));
                    let mut actions = vec![LifecycleAction::DropLink(CloseReason::new(
                        CLOSE_HEARTBEAT_TIMEOUT,
                        "heartbeat timeout",
                    ))];
                    actions.extend(self.schedule_reconnect(now));
                    actions
                }
            },
            ConnectionState::Disconnected | ConnectionState::Failed(_) => Vec::new(),
        }
    }

    /// Earliest instant at which `poll` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Connecting => self.connect_deadline,
            ConnectionState::Reconnecting => self.reconnect_at,
            ConnectionState::Connected => self.heartbeat.next_deadline(),
            ConnectionState::Disconnected | ConnectionState::Failed(_) => None,
        }
    }

    fn begin_connecting(&mut self, now: Instant) -> Vec<LifecycleAction> {
        self.reconnect_at = None;
        self.connect_deadline = Some(now + self.config.connect_timeout);
        debug!("Connecting (attempt {})", self.attempts);
        self.transition(ConnectionState::Connecting);
        vec![LifecycleAction::OpenLink]
    }

    fn schedule_reconnect(&mut self, now: Instant) -> Vec<LifecycleAction> {
        self.heartbeat.stop();
        self.connect_deadline = None;
        self.attempts += 1;

        if !self.config.backoff.allows(self.attempts) {
            let attempts = self.attempts - 1;
            warn!("Reconnection budget exhausted after {} attempts", attempts);
            self.reconnect_at = None;
            self.transition(ConnectionState::Failed(TerminalFailure::RetriesExhausted {
                attempts,
            }));
            return Vec::new();
        }

        let delay = self.config.backoff.delay(self.attempts);
        info!("Reconnecting in {:?} (attempt {})", delay, self.attempts);
        self.reconnect_at = Some(now + delay);
        self.transition(ConnectionState::Reconnecting);
        Vec::new()
    }

    fn cancel_timers(&mut self) {
        self.heartbeat.stop();
        self.connect_deadline = None;
        self.reconnect_at = None;
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tavern_protocol::MessageType;

    fn welcome() -> Envelope {
        Envelope::from_json(MessageType::Welcome, json!({ "session_id": "s-1" }))
    }

    fn connected(now: Instant) -> ConnectionManager {
        let mut manager = ConnectionManager::new(LifecycleConfig::default());
        manager.connect(now);
        manager.on_handshake(now, &welcome());
        manager
    }

    #[test]
    fn test_connect_then_handshake() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(LifecycleConfig::default());

        assert_eq!(manager.connect(now), vec![LifecycleAction::OpenLink]);
        assert_eq!(manager.state(), &ConnectionState::Connecting);
        assert!(!manager.can_send());

        assert_eq!(manager.on_handshake(now, &welcome()), vec![LifecycleAction::FlushQueues]);
        assert_eq!(manager.state(), &ConnectionState::Connected);
        assert_eq!(manager.session_id(), Some("s-1"));
        assert!(manager.is_connected(true));
        assert!(!manager.is_connected(false));
        assert_eq!(manager.drain_events(), vec![ConnectionEvent::Connected]);
    }

    #[test]
    fn test_abnormal_close_schedules_backoff() {
        let now = Instant::now();
        let mut manager = connected(now);

        manager.on_closed(now, CloseReason::abnormal("reset"));
        assert_eq!(manager.state(), &ConnectionState::Reconnecting);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(1)));

        assert!(manager.poll(now + Duration::from_millis(999)).is_empty());
        assert_eq!(manager.poll(now + Duration::from_secs(1)), vec![LifecycleAction::OpenLink]);
        assert_eq!(manager.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn test_clean_close_does_not_reconnect() {
        let now = Instant::now();
        let mut manager = connected(now);
        manager.drain_events();

        manager.on_closed(now, CloseReason::normal());
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert_eq!(manager.next_deadline(), None);
        assert_eq!(
            manager.drain_events(),
            vec![ConnectionEvent::Disconnected(Some(CloseReason::normal()))]
        );
    }

    #[test]
    fn test_access_denied_is_terminal() {
        let now = Instant::now();
        let mut manager = connected(now);

        let reason = CloseReason::access_denied("banned");
        manager.on_closed(now, reason.clone());
        assert_eq!(
            manager.state(),
            &ConnectionState::Failed(TerminalFailure::Rejected(reason))
        );
        assert_eq!(manager.next_deadline(), None);
        assert!(manager.poll(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_retry_budget_exhaustion_is_distinct_from_rejection() {
        let config = LifecycleConfig {
            backoff: BackoffConfig {
                max_attempts: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut manager = ConnectionManager::new(config);
        let mut now = Instant::now();
        manager.connect(now);

        for _ in 0..2 {
            manager.on_connect_failed(now, "refused");
            assert_eq!(manager.state(), &ConnectionState::Reconnecting);
            now = manager.next_deadline().unwrap();
            assert_eq!(manager.poll(now), vec![LifecycleAction::OpenLink]);
        }
        manager.on_connect_failed(now, "refused");

        assert_eq!(
            manager.state(),
            &ConnectionState::Failed(TerminalFailure::RetriesExhausted { attempts: 2 })
        );
    }

    #[test]
    fn test_handshake_timeout_counts_as_failure() {
        let now = Instant::now();
        let mut manager = ConnectionManager::new(LifecycleConfig::default());
        manager.connect(now);

        let actions = manager.poll(now + Duration::from_secs(10));
        assert!(matches!(actions.as_slice(), [LifecycleAction::DropLink(_)]));
        assert_eq!(manager.state(), &ConnectionState::Reconnecting);
        assert_eq!(manager.attempts(), 1);
    }

    #[test]
    fn test_heartbeat_timeout_forces_reconnect() {
        let t0 = Instant::now();
        let mut manager = connected(t0);
        manager.drain_events();

        let probe_at = t0 + Duration::from_secs(30);
        let actions = manager.poll(probe_at);
        assert!(matches!(actions.as_slice(), [LifecycleAction::SendPing(_)]));
        assert!(manager.can_send());

        let actions = manager.poll(probe_at + Duration::from_secs(5));
        assert!(matches!(
            actions.as_slice(),
            [LifecycleAction::DropLink(CloseReason { code: CLOSE_HEARTBEAT_TIMEOUT, .. })]
        ));
        assert_eq!(manager.state(), &ConnectionState::Reconnecting);
        assert!(!manager.is_connected(true));
        assert_eq!(
            manager.drain_events(),
            vec![ConnectionEvent::Timeout, ConnectionEvent::Disconnected(None)]
        );

        // The late pong does not resurrect the session
        assert!(!manager.on_pong(
            probe_at + Duration::from_secs(6),
            &Envelope::pong_for(&Envelope::ping(1, 0))
        ));
        assert_eq!(manager.state(), &ConnectionState::Reconnecting);
    }

    #[test]
    fn test_matching_pong_keeps_session() {
        let t0 = Instant::now();
        let mut manager = connected(t0);
        let probe_at = t0 + Duration::from_secs(30);

        let ping = match manager.poll(probe_at).pop() {
            Some(LifecycleAction::SendPing(ping)) => ping,
            other => panic!("expected ping, got {other:?}"),
        };
        assert!(manager.on_pong(probe_at + Duration::from_millis(20), &Envelope::pong_for(&ping)));
        assert!(manager.poll(probe_at + Duration::from_secs(6)).is_empty());
        assert_eq!(manager.state(), &ConnectionState::Connected);
    }

    #[test]
    fn test_attempts_reset_after_successful_connect() {
        let mut now = Instant::now();
        let mut manager = connected(now);

        manager.on_closed(now, CloseReason::abnormal("reset"));
        now = manager.next_deadline().unwrap();
        manager.poll(now);
        manager.on_connect_failed(now, "refused");
        assert_eq!(manager.attempts(), 2);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(2)));

        now = manager.next_deadline().unwrap();
        manager.poll(now);
        manager.on_handshake(now, &welcome());
        assert_eq!(manager.attempts(), 0);

        manager.on_closed(now, CloseReason::abnormal("reset"));
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_disconnect_cancels_everything() {
        let now = Instant::now();
        let mut manager = connected(now);
        manager.on_closed(now, CloseReason::abnormal("reset"));

        assert_eq!(
            manager.disconnect(),
            vec![LifecycleAction::DropLink(CloseReason::normal())]
        );
        assert_eq!(manager.state(), &ConnectionState::Disconnected);
        assert_eq!(manager.next_deadline(), None);
        assert!(manager.disconnect().is_empty());
    }
}
