//! Close conditions exchanged when a link ends

use serde::{Deserialize, Serialize};
use std::fmt;

/// Orderly shutdown requested by either side
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is going away (server restart, client exit)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Link dropped without a close handshake
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Generic policy violation
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Liveness probe went unanswered
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;
/// Handshake was refused or malformed
pub const CLOSE_PROTOCOL_MISMATCH: u16 = 4002;
/// The participant was excluded from the session
pub const CLOSE_ACCESS_DENIED: u16 = 4003;

/// Reasons that mark a policy close as an authorization denial
const DENIAL_REASONS: &[&str] = &["kicked", "banned", "unauthorized"];

/// Close code plus human readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Orderly close
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "normal closure")
    }

    /// Close without a proper handshake (transport failure)
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Exclusion from the session
    pub fn access_denied(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ACCESS_DENIED, reason)
    }

    /// Whether the peer closed on purpose and expects no reconnection
    pub fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL
    }

    /// Whether reconnecting would be futile
    pub fn is_authorization_denied(&self) -> bool {
        if self.code == CLOSE_ACCESS_DENIED {
            return true;
        }
        if self.code == CLOSE_POLICY_VIOLATION {
            let reason = self.reason.to_ascii_lowercase();
            return DENIAL_REASONS.iter().any(|r| reason.contains(r));
        }
        false
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}
