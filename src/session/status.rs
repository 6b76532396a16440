use crate::session::state::{SessionPhase, SessionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;

/// Point-in-time view of the session for external polling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub connected: bool,
    pub handshake_artifact: Option<String>,
    /// Since `connected_since` while connected, since process start otherwise
    pub uptime: Duration,
    pub connected_since: Option<DateTime<Utc>>,
    pub handshake_count: u64,
    pub retry_attempt: u32,
    pub generation: u64,
    pub fatal: Option<String>,
}

/// Read-only window onto the state the session manager publishes
#[derive(Debug, Clone)]
pub struct StatusReporter {
    state: watch::Receiver<SessionState>,
    started_at: DateTime<Utc>,
}

impl StatusReporter {
    pub fn new(state: watch::Receiver<SessionState>, started_at: DateTime<Utc>) -> Self {
        Self { state, started_at }
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state.borrow().clone();
        Self::build(&state, self.started_at, Utc::now())
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait until a published state satisfies `predicate`.
    ///
    /// Returns `None` once the manager is gone without ever matching.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Option<SessionStatus>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut state = self.state.clone();
        let matched = {
            let guard = state.wait_for(|s| predicate(s)).await.ok()?;
            SessionState::clone(&guard)
        };
        Some(Self::build(&matched, self.started_at, Utc::now()))
    }

    pub async fn wait_for_phase(&self, phase: SessionPhase) -> Option<SessionStatus> {
        self.wait_until(|state| state.phase == phase).await
    }

    fn build(state: &SessionState, started_at: DateTime<Utc>, now: DateTime<Utc>) -> SessionStatus {
        let since = match (state.phase, state.connected_since) {
            (SessionPhase::Connected, Some(connected_since)) => connected_since,
            _ => started_at,
        };
        let uptime = now
            .signed_duration_since(since)
            .to_std()
            .unwrap_or(Duration::ZERO);

        SessionStatus {
            phase: state.phase,
            connected: state.is_connected(),
            handshake_artifact: state.handshake_artifact.clone(),
            uptime,
            connected_since: state.connected_since,
            handshake_count: state.handshake_count,
            retry_attempt: state.retry_attempt,
            generation: state.generation,
            fatal: state.fatal.clone(),
        }
    }
}
