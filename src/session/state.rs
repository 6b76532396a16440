use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the session is in its connect/reconnect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    HandshakeReady,
    Connected,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakeReady => "handshake_ready",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of the single session, owned by the session manager.
///
/// Readers only ever see clones published through the status channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Present only while `phase == HandshakeReady`
    pub handshake_artifact: Option<String>,
    /// Present only while `phase == Connected`
    pub connected_since: Option<DateTime<Utc>>,
    /// Handshake artifacts produced so far; never reset
    pub handshake_count: u64,
    pub retry_attempt: u32,
    /// Bumped on every connect; events and timers from older generations are ignored
    pub generation: u64,
    /// Set when recovery gave up and manual intervention is required
    pub fatal: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a connection attempt and return its generation
    pub fn begin_connecting(&mut self, attempt: u32) -> u64 {
        self.generation += 1;
        self.phase = SessionPhase::Connecting;
        self.handshake_artifact = None;
        self.connected_since = None;
        self.retry_attempt = attempt;
        self.generation
    }

    pub fn set_handshake(&mut self, artifact: String) {
        self.phase = SessionPhase::HandshakeReady;
        self.handshake_artifact = Some(artifact);
        self.connected_since = None;
        self.handshake_count += 1;
    }

    pub fn mark_connected(&mut self) {
        self.phase = SessionPhase::Connected;
        self.handshake_artifact = None;
        self.connected_since = Some(Utc::now());
        self.retry_attempt = 0;
        self.fatal = None;
    }

    pub fn mark_disconnected(&mut self) {
        self.phase = SessionPhase::Disconnected;
        self.handshake_artifact = None;
        self.connected_since = None;
    }

    /// Clear everything an explicit reset discards; counters survive
    pub fn clear_for_reset(&mut self) {
        self.phase = SessionPhase::Connecting;
        self.handshake_artifact = None;
        self.connected_since = None;
        self.retry_attempt = 0;
        self.fatal = None;
    }

    pub fn is_connected(&self) -> bool {
        self.phase == SessionPhase::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_cleared_on_leaving_phase() {
        let mut state = SessionState::new();
        state.begin_connecting(0);
        state.set_handshake("qr-payload".to_string());
        assert_eq!(state.phase, SessionPhase::HandshakeReady);
        assert_eq!(state.handshake_count, 1);

        state.mark_connected();
        assert!(state.handshake_artifact.is_none());
        assert!(state.connected_since.is_some());

        state.mark_disconnected();
        assert!(state.connected_since.is_none());
        assert_eq!(state.handshake_count, 1);
    }

    #[test]
    fn test_generation_increases_per_attempt() {
        let mut state = SessionState::new();
        let first = state.begin_connecting(0);
        let second = state.begin_connecting(3);
        assert!(second > first);
        assert_eq!(state.retry_attempt, 3);
    }

    #[test]
    fn test_connected_resets_retry_attempt() {
        let mut state = SessionState::new();
        state.begin_connecting(2);
        state.fatal = Some("gave up".to_string());
        state.mark_connected();
        assert_eq!(state.retry_attempt, 0);
        assert!(state.fatal.is_none());
    }
}
