use crate::credentials::{BackupConfig, BackupScheduler, CredentialStore, StoreError};
use crate::dispatch::DispatchJob;
use crate::session::backoff::RetryConfig;
use crate::session::recovery::{CredentialAction, RecoveryAction, RecoveryPolicy, SetupRecovery};
use crate::session::state::{SessionPhase, SessionState};
use crate::session::status::{SessionStatus, StatusReporter};
use crate::session::timer::ReconnectTimer;
use crate::transport::{
    ConnectionUpdate, DisconnectReason, Established, SessionEvent, SessionHandle, SetupError,
    Transport, TransportConfig,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session setup failed after {attempts} attempts: {source}")]
    SetupExhausted {
        attempts: u32,
        #[source]
        source: SetupError,
    },
    #[error("session manager is not running")]
    ManagerStopped,
}

/// Session timing and buffering knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay before reconnecting after the server closed the connection
    pub server_close_delay_ms: u64,
    /// Upper bound on the best-effort logout during teardown
    pub logout_timeout_ms: u64,
    /// Capacity of the manager's command queue
    pub event_buffer: usize,
}

impl SessionConfig {
    pub fn server_close_delay(&self) -> Duration {
        Duration::from_millis(self.server_close_delay_ms)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_millis(self.logout_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_close_delay_ms: 2_000,
            logout_timeout_ms: 5_000,
            event_buffer: 256,
        }
    }
}

/// Everything the session manager needs to know up front
#[derive(Debug, Clone, Default)]
pub struct SessionManagerConfig {
    pub session: SessionConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    pub backup: BackupConfig,
}

/// Lifecycle events broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    HandshakeReady { count: u64 },
    Connected { generation: u64 },
    Disconnected { generation: u64, reason: DisconnectReason },
    SetupFailed { attempt: u32, error: String },
    ReconnectScheduled { generation: u64, attempt: u32, delay: Duration },
    CredentialsWiped,
    PairingCleared,
    GaveUp { reason: String },
    Reset,
}

pub(crate) enum ManagerCommand {
    Session { generation: u64, event: SessionEvent },
    ReconnectDue { generation: u64, attempt: u32 },
    Reset { reply: oneshot::Sender<bool> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable handle for talking to a running session manager
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<ManagerCommand>,
    status: StatusReporter,
    ready: watch::Receiver<bool>,
    notices: broadcast::Sender<LifecycleNotice>,
}

impl SessionController {
    /// Tear down the current session and start over with a fresh attempt.
    ///
    /// Never fails; returns false when the reset could not be carried out.
    pub async fn reset(&self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.commands.send(ManagerCommand::Reset { reply }).await.is_err() {
            warn!("Reset requested but the session manager is not running");
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.status()
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.status
    }

    /// Resolve once the first connect cycle finished, successfully or not.
    ///
    /// Returns false if the manager went away before that.
    pub async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.clone();
        ready.wait_for(|ready| *ready).await.is_ok()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotice> {
        self.notices.subscribe()
    }

    /// Cancel timers, tear down the session and stop the manager
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ManagerCommand::Shutdown { reply })
            .await
            .map_err(|_| SessionError::ManagerStopped)?;
        response.await.map_err(|_| SessionError::ManagerStopped)
    }

    pub(crate) async fn send_command(&self, command: ManagerCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ManagerStopped)
    }
}

struct ActiveSession {
    generation: u64,
    handle: Arc<dyn SessionHandle>,
    forwarder: JoinHandle<()>,
    /// The transport reported the session closed; later events are dropped
    closed: bool,
}

/// Owns the single session and drives it through connect, recovery and reset.
///
/// All state changes happen on the manager's own task, one command at a
/// time. Session events, reconnect timers and controller requests all
/// arrive through the same queue.
pub struct SessionManager {
    config: SessionManagerConfig,
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    jobs: mpsc::Sender<DispatchJob>,
    recovery: RecoveryPolicy,
    state: SessionState,
    active: Option<ActiveSession>,
    timer: ReconnectTimer,
    backups: Option<BackupScheduler>,
    commands_tx: mpsc::Sender<ManagerCommand>,
    commands_rx: mpsc::Receiver<ManagerCommand>,
    state_tx: watch::Sender<SessionState>,
    ready_tx: watch::Sender<bool>,
    notices: broadcast::Sender<LifecycleNotice>,
    controller: SessionController,
}

impl SessionManager {
    pub fn new(
        config: SessionManagerConfig,
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        jobs: mpsc::Sender<DispatchJob>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.session.event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SessionState::new());
        let (ready_tx, ready_rx) = watch::channel(false);
        let (notices, _) = broadcast::channel(64);

        let controller = SessionController {
            commands: commands_tx.clone(),
            status: StatusReporter::new(state_rx, Utc::now()),
            ready: ready_rx,
            notices: notices.clone(),
        };
        let recovery = RecoveryPolicy::new(&config.retry, config.session.server_close_delay());

        Self {
            config,
            transport,
            store,
            jobs,
            recovery,
            state: SessionState::new(),
            active: None,
            timer: ReconnectTimer::new(),
            backups: None,
            commands_tx,
            commands_rx,
            state_tx,
            ready_tx,
            notices,
            controller,
        }
    }

    /// Controller for this manager; usable before the manager is spawned
    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<(), SessionError>> {
        tokio::spawn(self.run())
    }

    /// Connect and process commands until shutdown.
    ///
    /// Returns an error only for fatal conditions: the credential store
    /// failing to load, or session setup exhausting its retries.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!(
            transport = self.transport.transport_name(),
            "Session manager starting"
        );

        let result = self.event_loop().await;
        self.stop_all().await;

        match &result {
            Ok(()) => info!("Session manager stopped"),
            Err(e) => error!("Session manager stopped with a fatal error: {}", e),
        }
        result
    }

    async fn event_loop(&mut self) -> Result<(), SessionError> {
        self.connect(0).await?;

        while let Some(command) = self.commands_rx.recv().await {
            match command {
                ManagerCommand::Session { generation, event } => {
                    self.on_session_event(generation, event).await?;
                }
                ManagerCommand::ReconnectDue {
                    generation,
                    attempt,
                } => {
                    if generation != self.state.generation {
                        debug!(
                            generation,
                            current = self.state.generation,
                            "Ignoring reconnect timer from a stale generation"
                        );
                        continue;
                    }
                    self.connect(attempt).await?;
                }
                ManagerCommand::Reset { reply } => {
                    info!("Session reset requested");
                    let succeeded = match self.full_reset().await {
                        Ok(()) => true,
                        Err(e) => {
                            error!("Session reset failed: {}", e);
                            false
                        }
                    };
                    let _ = reply.send(succeeded);
                }
                ManagerCommand::Shutdown { reply } => {
                    info!("Session shutdown requested");
                    self.stop_all().await;
                    let _ = reply.send(());
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Tear down whatever is live and establish a new session for retry number `attempt`
    async fn connect(&mut self, attempt: u32) -> Result<(), SessionError> {
        self.timer.cancel();
        self.teardown_session().await;

        let generation = self.state.begin_connecting(attempt);
        self.publish();
        info!(generation, attempt, "Connecting session");

        let credentials = self.store.load().await?;
        let timeout = self.config.transport.connect_timeout();
        let established = match tokio::time::timeout(
            timeout,
            self.transport.establish(credentials, &self.config.transport),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SetupError::Timeout(timeout)),
        };

        match established {
            Ok(established) => {
                self.attach(generation, established);
                self.mark_ready();
                Ok(())
            }
            Err(error) => self.on_setup_failure(generation, attempt, error),
        }
    }

    fn attach(&mut self, generation: u64, established: Established) {
        let Established { handle, mut events } = established;
        let commands = self.commands_tx.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if commands
                    .send(ManagerCommand::Session { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!(generation, "Session event stream ended");
        });

        debug!(generation, handle = %handle.id(), "Session established");
        self.active = Some(ActiveSession {
            generation,
            handle,
            forwarder,
            closed: false,
        });
    }

    fn on_setup_failure(
        &mut self,
        generation: u64,
        attempt: u32,
        error: SetupError,
    ) -> Result<(), SessionError> {
        warn!(generation, attempt, "Session setup failed: {}", error);
        self.state.mark_disconnected();
        self.notify(LifecycleNotice::SetupFailed {
            attempt,
            error: error.to_string(),
        });

        match self.recovery.plan_setup_failure(attempt) {
            SetupRecovery::Retry {
                delay,
                attempt: next,
            } => {
                self.state.retry_attempt = next;
                self.publish();
                self.schedule_reconnect(generation, next, delay);
                Ok(())
            }
            SetupRecovery::GiveUp { reason } => {
                error!(generation, "{}", reason);
                self.state.fatal = Some(reason);
                self.publish();
                self.mark_ready();
                Err(SessionError::SetupExhausted {
                    attempts: attempt + 1,
                    source: error,
                })
            }
        }
    }

    async fn on_session_event(
        &mut self,
        generation: u64,
        event: SessionEvent,
    ) -> Result<(), SessionError> {
        let Some(active) = &self.active else {
            debug!(generation, "Ignoring event with no live session");
            return Ok(());
        };
        if active.generation != generation || active.closed {
            debug!(generation, "Ignoring event from a stale session");
            return Ok(());
        }

        match event {
            SessionEvent::Connection(update) => self.on_connection_update(update).await,
            SessionEvent::Credentials(credentials) => {
                // Persist before anything else can snapshot the store
                if let Err(e) = self.store.on_change(&credentials).await {
                    error!(generation, "Failed to persist updated credentials: {}", e);
                }
                Ok(())
            }
            SessionEvent::Messages(batch) => {
                let job = DispatchJob {
                    batch,
                    handle: active.handle.clone(),
                };
                if self.jobs.send(job).await.is_err() {
                    warn!(generation, "Dispatcher is gone, dropping inbound messages");
                }
                Ok(())
            }
        }
    }

    async fn on_connection_update(&mut self, update: ConnectionUpdate) -> Result<(), SessionError> {
        let generation = self.state.generation;
        match update {
            ConnectionUpdate::HandshakeArtifact(artifact) => {
                self.state.set_handshake(artifact);
                self.publish();
                info!(
                    generation,
                    count = self.state.handshake_count,
                    "Handshake artifact ready, waiting for pairing"
                );
                self.notify(LifecycleNotice::HandshakeReady {
                    count: self.state.handshake_count,
                });
                Ok(())
            }
            ConnectionUpdate::Opened => {
                self.state.mark_connected();
                self.publish();
                info!(generation, "Session connected");
                self.notify(LifecycleNotice::Connected { generation });
                self.ensure_backups();
                self.mark_ready();
                Ok(())
            }
            ConnectionUpdate::Closed { reason, detail } => {
                self.on_closed(reason, detail).await
            }
        }
    }

    async fn on_closed(
        &mut self,
        reason: DisconnectReason,
        detail: Option<String>,
    ) -> Result<(), SessionError> {
        let generation = self.state.generation;
        if let Some(active) = self.active.as_mut() {
            active.closed = true;
            active.forwarder.abort();
        }

        self.state.mark_disconnected();
        self.publish();
        warn!(
            generation,
            reason = %reason,
            detail = detail.as_deref().unwrap_or(""),
            retry_attempt = self.state.retry_attempt,
            "Session closed"
        );
        self.notify(LifecycleNotice::Disconnected { generation, reason });

        let recovery = self.recovery.plan(reason, self.state.retry_attempt);
        match recovery.credentials {
            CredentialAction::Keep => {}
            CredentialAction::Wipe => {
                self.store.wipe().await;
                warn!(generation, reason = %reason, "Credentials wiped, a new handshake is required");
                self.notify(LifecycleNotice::CredentialsWiped);
            }
            CredentialAction::ForgetPairing => {
                if let Err(e) = self.store.forget_pairing().await {
                    error!(generation, "Failed to clear pairing: {}", e);
                }
                warn!(generation, reason = %reason, "Pairing cleared, a new handshake is required");
                self.notify(LifecycleNotice::PairingCleared);
            }
        }

        match recovery.action {
            RecoveryAction::Reconnect { delay, attempt } => {
                self.state.retry_attempt = attempt;
                self.publish();
                self.schedule_reconnect(generation, attempt, delay);
                Ok(())
            }
            RecoveryAction::ReconnectNow { attempt } => self.connect(attempt).await,
            RecoveryAction::FullReset => self.full_reset().await,
            RecoveryAction::GiveUp { reason } => {
                error!(generation, "{}", reason);
                self.teardown_session().await;
                self.state.fatal = Some(reason.clone());
                self.publish();
                self.notify(LifecycleNotice::GaveUp { reason });
                self.mark_ready();
                Ok(())
            }
        }
    }

    /// Drop the session and its state, then start again from retry 0
    async fn full_reset(&mut self) -> Result<(), SessionError> {
        self.timer.cancel();
        self.stop_backups();
        self.teardown_session().await;

        self.state.clear_for_reset();
        self.publish();
        self.notify(LifecycleNotice::Reset);

        self.connect(0).await
    }

    fn schedule_reconnect(&mut self, generation: u64, attempt: u32, delay: Duration) {
        info!(
            generation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        self.timer.schedule(
            generation,
            delay,
            self.commands_tx.clone(),
            ManagerCommand::ReconnectDue {
                generation,
                attempt,
            },
        );
        self.notify(LifecycleNotice::ReconnectScheduled {
            generation,
            attempt,
            delay,
        });
    }

    /// Detach from the live session and log it out, ignoring failures
    async fn teardown_session(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.forwarder.abort();

        let timeout = self.config.session.logout_timeout();
        match tokio::time::timeout(timeout, active.handle.logout()).await {
            Ok(Ok(())) => debug!(generation = active.generation, "Previous session logged out"),
            Ok(Err(e)) => warn!(
                generation = active.generation,
                "Ignoring logout failure during teardown: {}", e
            ),
            Err(_) => warn!(
                generation = active.generation,
                "Logout did not finish within {:?}, continuing", timeout
            ),
        }
    }

    fn ensure_backups(&mut self) {
        if self
            .backups
            .as_ref()
            .is_some_and(|scheduler| scheduler.is_running())
        {
            return;
        }
        self.backups = Some(BackupScheduler::start(
            self.store.clone(),
            &self.config.backup,
        ));
    }

    fn stop_backups(&mut self) {
        if let Some(scheduler) = self.backups.take() {
            scheduler.stop();
        }
    }

    async fn stop_all(&mut self) {
        self.timer.cancel();
        self.stop_backups();
        self.teardown_session().await;

        if self.state.phase != SessionPhase::Disconnected {
            self.state.mark_disconnected();
            self.publish();
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn notify(&self, notice: LifecycleNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn mark_ready(&self) {
        self.ready_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
    }
}
