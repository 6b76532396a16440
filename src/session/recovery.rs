use crate::session::backoff::{BackoffPolicy, RetryConfig};
use crate::transport::DisconnectReason;
use std::time::Duration;

/// What the session manager does after a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Reconnect after `delay` with retry number `attempt`
    Reconnect { delay: Duration, attempt: u32 },
    /// Reconnect right away with retry number `attempt`
    ReconnectNow { attempt: u32 },
    /// Drop the session state and start over with a fresh handshake
    FullReset,
    /// Stop retrying; manual intervention is required
    GiveUp { reason: String },
}

/// What happens to stored credentials before the recovery action runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAction {
    Keep,
    /// Delete the material and every snapshot; auth failures only
    Wipe,
    /// Replace the primary material with unpaired material, keeping snapshots
    ForgetPairing,
}

/// Recovery plan for one disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub credentials: CredentialAction,
    pub action: RecoveryAction,
}

/// What the session manager does after a failed `establish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupRecovery {
    /// Try again after `delay` with retry number `attempt`
    Retry { delay: Duration, attempt: u32 },
    /// Retries are exhausted; this is fatal to the process
    GiveUp { reason: String },
}

/// Maps failure causes to recovery actions
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    backoff: BackoffPolicy,
    max_retries: u32,
    server_close_delay: Duration,
}

impl RecoveryPolicy {
    pub fn new(retry: &RetryConfig, server_close_delay: Duration) -> Self {
        Self {
            backoff: BackoffPolicy::from_config(retry),
            max_retries: retry.max_retries,
            server_close_delay,
        }
    }

    /// Plan recovery for a session closed with `reason` at retry number `retry_attempt`
    pub fn plan(&self, reason: DisconnectReason, retry_attempt: u32) -> Recovery {
        match reason {
            DisconnectReason::LoggedOut | DisconnectReason::Unauthorized => {
                let action = if retry_attempt < self.max_retries {
                    self.backoff_reconnect(retry_attempt)
                } else {
                    RecoveryAction::FullReset
                };
                Recovery {
                    credentials: CredentialAction::Wipe,
                    action,
                }
            }
            DisconnectReason::ConnectionClosed => Recovery {
                credentials: CredentialAction::Keep,
                action: RecoveryAction::Reconnect {
                    delay: self.server_close_delay,
                    attempt: 0,
                },
            },
            DisconnectReason::ConnectionLost => Recovery {
                credentials: CredentialAction::Keep,
                action: RecoveryAction::ReconnectNow { attempt: 0 },
            },
            // Another client owns the account now, so only a fresh pairing helps.
            // The credentials are still valid, so snapshots survive.
            DisconnectReason::ConnectionReplaced => Recovery {
                credentials: CredentialAction::ForgetPairing,
                action: RecoveryAction::FullReset,
            },
            DisconnectReason::Unknown | DisconnectReason::Other(_) => {
                let action = if retry_attempt < self.max_retries {
                    self.backoff_reconnect(retry_attempt)
                } else {
                    RecoveryAction::GiveUp {
                        reason: format!(
                            "session closed ({}) after {} retries, manual intervention required",
                            reason, retry_attempt
                        ),
                    }
                };
                Recovery {
                    credentials: CredentialAction::Keep,
                    action,
                }
            }
        }
    }

    /// Plan recovery for a failed `establish` at retry number `attempt`
    pub fn plan_setup_failure(&self, attempt: u32) -> SetupRecovery {
        if attempt < self.max_retries {
            SetupRecovery::Retry {
                delay: self.backoff.delay(attempt),
                attempt: attempt + 1,
            }
        } else {
            SetupRecovery::GiveUp {
                reason: format!("session setup failed after {} attempts", attempt + 1),
            }
        }
    }

    fn backoff_reconnect(&self, attempt: u32) -> RecoveryAction {
        RecoveryAction::Reconnect {
            delay: self.backoff.delay(attempt),
            attempt: attempt + 1,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default(), Duration::from_millis(2_000))
    }
}
