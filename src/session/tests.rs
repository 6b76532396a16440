use crate::credentials::{BackupConfig, CredentialStore, Credentials};
use crate::dispatch::DispatchJob;
use crate::session::*;
use crate::transport::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(600);

struct TestSession {
    _dir: TempDir,
    transport: Arc<MemoryTransport>,
    store: Arc<CredentialStore>,
    controller: SessionController,
    notices: broadcast::Receiver<LifecycleNotice>,
    jobs: mpsc::Receiver<DispatchJob>,
    task: JoinHandle<Result<(), SessionError>>,
}

/// Helper function to create a deterministic manager configuration
fn create_test_config(max_retries: u32) -> SessionManagerConfig {
    SessionManagerConfig {
        retry: RetryConfig {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        },
        backup: BackupConfig {
            interval_ms: 60_000,
            retention: 3,
            compress: false,
        },
        ..Default::default()
    }
}

/// Helper function to spawn a manager over a memory transport
async fn start_test_session(
    transport: MemoryTransport,
    config: SessionManagerConfig,
    seed: Option<Credentials>,
) -> TestSession {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let store = Arc::new(CredentialStore::open(dir.path().join("auth_info")).unwrap());
    if let Some(credentials) = seed {
        store.on_change(&credentials).await.unwrap();
    }

    let transport = Arc::new(transport);
    let (jobs_tx, jobs) = mpsc::channel(16);
    let manager = SessionManager::new(config, transport.clone(), store.clone(), jobs_tx);
    let controller = manager.controller();
    let notices = controller.subscribe();
    let task = manager.spawn();

    TestSession {
        _dir: dir,
        transport,
        store,
        controller,
        notices,
        jobs,
        task,
    }
}

fn paired_credentials() -> Credentials {
    Credentials::paired("15550001111@s.chat").with_key("noise", "a2V5")
}

async fn wait_for_phase(session: &TestSession, phase: SessionPhase) -> SessionStatus {
    tokio::time::timeout(WAIT, session.controller.reporter().wait_for_phase(phase))
        .await
        .expect("timed out waiting for phase")
        .expect("session manager stopped")
}

async fn wait_for_status<F>(session: &TestSession, predicate: F) -> SessionStatus
where
    F: FnMut(&SessionState) -> bool,
{
    tokio::time::timeout(WAIT, session.controller.reporter().wait_until(predicate))
        .await
        .expect("timed out waiting for status")
        .expect("session manager stopped")
}

async fn wait_for_sessions(transport: &MemoryTransport, count: usize) {
    tokio::time::timeout(WAIT, async {
        while transport.sessions_established() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for sessions");
}

async fn next_notice<F>(
    notices: &mut broadcast::Receiver<LifecycleNotice>,
    mut predicate: F,
) -> LifecycleNotice
where
    F: FnMut(&LifecycleNotice) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let notice = notices.recv().await.expect("notice stream closed");
            if predicate(&notice) {
                return notice;
            }
        }
    })
    .await
    .expect("timed out waiting for notice")
}

#[tokio::test(start_paused = true)]
async fn test_connect_reaches_connected() {
    let session = start_test_session(MemoryTransport::new(), create_test_config(3), None).await;

    let status = wait_for_phase(&session, SessionPhase::Connected).await;
    assert!(status.connected);
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(status.generation, 1);
    assert!(status.connected_since.is_some());
    assert!(status.handshake_artifact.is_none());

    assert!(session.controller.wait_ready().await);
    assert_eq!(session.transport.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_then_pairing_persists_credentials() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Handshake {
        auto_pair_after: Some(Duration::from_secs(5)),
    });
    let session = start_test_session(transport, create_test_config(3), None).await;

    let handshake = wait_for_phase(&session, SessionPhase::HandshakeReady).await;
    assert!(handshake.handshake_artifact.is_some());
    assert_eq!(handshake.handshake_count, 1);
    assert!(!handshake.connected);

    let connected = wait_for_phase(&session, SessionPhase::Connected).await;
    assert!(connected.handshake_artifact.is_none());
    assert_eq!(connected.handshake_count, 1);

    // Credential updates are persisted before the open is processed
    let stored = session.store.load().await.unwrap();
    assert!(stored.is_registered());
}

#[tokio::test(start_paused = true)]
async fn test_auth_invalid_wipes_before_retry() {
    let mut session = start_test_session(
        MemoryTransport::new(),
        create_test_config(3),
        Some(paired_credentials()),
    )
    .await;
    wait_for_phase(&session, SessionPhase::Connected).await;
    assert!(!session.store.is_empty().await.unwrap());

    assert!(session.transport.close_current(DisconnectReason::LoggedOut).await);

    let scheduled = next_notice(&mut session.notices, |notice| {
        matches!(notice, LifecycleNotice::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        LifecycleNotice::ReconnectScheduled {
            generation: 1,
            attempt: 1,
            delay: Duration::from_millis(100),
        }
    );
    let status = session.controller.status();
    assert_eq!(status.phase, SessionPhase::Disconnected);
    assert_eq!(status.retry_attempt, 1);
    assert!(session.store.is_empty().await.unwrap());

    let reconnected = wait_for_status(&session, |state| {
        state.generation == 2 && state.phase == SessionPhase::Connected
    })
    .await;
    assert_eq!(reconnected.retry_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn test_auth_invalid_with_no_budget_forces_full_reset() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Handshake {
        auto_pair_after: None,
    });
    let mut session = start_test_session(
        transport,
        create_test_config(0),
        Some(paired_credentials()),
    )
    .await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    session.transport.close_current(DisconnectReason::Unauthorized).await;

    next_notice(&mut session.notices, |notice| {
        *notice == LifecycleNotice::CredentialsWiped
    })
    .await;
    next_notice(&mut session.notices, |notice| *notice == LifecycleNotice::Reset).await;

    // Fresh material means the new session asks for a handshake
    let status = wait_for_phase(&session, SessionPhase::HandshakeReady).await;
    assert_eq!(status.handshake_count, 1);
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(session.transport.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects_after_fixed_delay() {
    let mut session = start_test_session(MemoryTransport::new(), create_test_config(3), None).await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    session
        .transport
        .close_current(DisconnectReason::ConnectionClosed)
        .await;

    let scheduled = next_notice(&mut session.notices, |notice| {
        matches!(notice, LifecycleNotice::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        LifecycleNotice::ReconnectScheduled {
            generation: 1,
            attempt: 0,
            delay: Duration::from_millis(2_000),
        }
    );

    let status = wait_for_status(&session, |state| {
        state.generation == 2 && state.phase == SessionPhase::Connected
    })
    .await;
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(session.transport.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connection_lost_reconnects_immediately() {
    let mut session = start_test_session(MemoryTransport::new(), create_test_config(3), None).await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    session
        .transport
        .close_current(DisconnectReason::ConnectionLost)
        .await;

    next_notice(&mut session.notices, |notice| {
        matches!(notice, LifecycleNotice::Disconnected { .. })
    })
    .await;
    let notice = next_notice(&mut session.notices, |notice| {
        matches!(
            notice,
            LifecycleNotice::Connected { .. } | LifecycleNotice::ReconnectScheduled { .. }
        )
    })
    .await;
    assert_eq!(notice, LifecycleNotice::Connected { generation: 2 });

    assert_eq!(session.transport.establish_attempts(), 2);
    assert_eq!(session.transport.live_handles(), 1);
    assert_eq!(session.transport.max_live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replaced_session_requires_fresh_handshake() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Handshake {
        auto_pair_after: None,
    });
    let mut session = start_test_session(
        transport,
        create_test_config(3),
        Some(paired_credentials()),
    )
    .await;
    let connected = wait_for_phase(&session, SessionPhase::Connected).await;
    assert_eq!(connected.handshake_count, 0);
    session.store.snapshot().await.unwrap();

    session
        .transport
        .close_current(DisconnectReason::ConnectionReplaced)
        .await;

    next_notice(&mut session.notices, |notice| {
        *notice == LifecycleNotice::PairingCleared
    })
    .await;
    let status = wait_for_phase(&session, SessionPhase::HandshakeReady).await;
    assert!(status.handshake_artifact.is_some());
    assert_eq!(status.handshake_count, 1);
    assert_eq!(session.transport.live_handles(), 1);

    // Only the pairing is dropped; snapshots are not wiped
    assert!(!session.store.load().await.unwrap().is_registered());
    assert_eq!(session.store.list_snapshots().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_close_gives_up_after_max_retries() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Manual);
    let session = start_test_session(transport, create_test_config(2), None).await;

    for generation in 1..=3u64 {
        wait_for_sessions(&session.transport, generation as usize).await;
        assert!(
            session
                .transport
                .close_current(DisconnectReason::Other(500))
                .await
        );
        if generation < 3 {
            wait_for_status(&session, |state| state.generation == generation + 1).await;
        }
    }

    let status = wait_for_status(&session, |state| state.fatal.is_some()).await;
    assert_eq!(status.phase, SessionPhase::Disconnected);
    assert_eq!(status.retry_attempt, 2);
    assert_eq!(session.transport.live_handles(), 0);
    assert!(session.controller.wait_ready().await);
    assert!(!session.task.is_finished());

    // The process keeps running and an explicit reset starts over
    assert!(session.controller.reset().await);
    let status = session.controller.status();
    assert_eq!(status.phase, SessionPhase::Connecting);
    assert!(status.fatal.is_none());
    assert_eq!(session.transport.live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_moves_to_connecting_and_clears_handshake() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Manual);
    let mut session = start_test_session(transport, create_test_config(3), None).await;
    wait_for_sessions(&session.transport, 1).await;

    session
        .transport
        .emit(SessionEvent::Connection(ConnectionUpdate::Opened))
        .await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    assert!(session.controller.reset().await);
    let status = session.controller.status();
    assert_eq!(status.phase, SessionPhase::Connecting);
    assert!(!status.connected);
    assert!(status.connected_since.is_none());
    next_notice(&mut session.notices, |notice| *notice == LifecycleNotice::Reset).await;

    session
        .transport
        .emit(SessionEvent::Connection(ConnectionUpdate::HandshakeArtifact(
            "qr-1".to_string(),
        )))
        .await;
    let handshake = wait_for_phase(&session, SessionPhase::HandshakeReady).await;
    assert_eq!(handshake.handshake_artifact.as_deref(), Some("qr-1"));

    assert!(session.controller.reset().await);
    let status = session.controller.status();
    assert_eq!(status.phase, SessionPhase::Connecting);
    assert!(status.handshake_artifact.is_none());
    assert_eq!(status.handshake_count, 1);
    assert_eq!(status.generation, 3);

    // Every reset tore the previous handle down first
    assert_eq!(session.transport.live_handles(), 1);
    assert_eq!(session.transport.max_live_handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_reconnect_timers_leave_one_handle() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Manual);
    let mut session = start_test_session(transport, create_test_config(3), None).await;
    wait_for_sessions(&session.transport, 1).await;

    session
        .transport
        .close_current(DisconnectReason::Unknown)
        .await;
    next_notice(&mut session.notices, |notice| {
        matches!(
            notice,
            LifecycleNotice::ReconnectScheduled { generation: 1, .. }
        )
    })
    .await;

    // Two fires for the same generation race the scheduled timer
    let first = session.controller.send_command(ManagerCommand::ReconnectDue {
        generation: 1,
        attempt: 1,
    });
    let second = session.controller.send_command(ManagerCommand::ReconnectDue {
        generation: 1,
        attempt: 1,
    });
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    wait_for_sessions(&session.transport, 2).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(session.transport.sessions_established(), 2);
    assert_eq!(session.transport.live_handles(), 1);
    assert_eq!(session.transport.max_live_handles(), 1);
    assert_eq!(session.controller.status().generation, 2);
}

#[tokio::test(start_paused = true)]
async fn test_setup_exhaustion_is_fatal() {
    let transport = MemoryTransport::new();
    transport.fail_next(3, SetupError::Unavailable("no route to host".to_string()));
    let session = start_test_session(transport, create_test_config(2), None).await;

    let result = tokio::time::timeout(WAIT, session.task)
        .await
        .expect("manager should exit")
        .expect("manager task panicked");

    match result {
        Err(SessionError::SetupExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected setup exhaustion, got {:?}", other),
    }
    assert!(session.controller.wait_ready().await);
    assert!(session.controller.status().fatal.is_some());
    assert_eq!(session.transport.establish_attempts(), 3);
    assert_eq!(session.transport.live_handles(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_retries_then_connects() {
    let transport = MemoryTransport::new();
    transport.fail_next(1, SetupError::Rejected("server busy".to_string()));
    let mut session = start_test_session(transport, create_test_config(3), None).await;

    let failed = next_notice(&mut session.notices, |notice| {
        matches!(notice, LifecycleNotice::SetupFailed { .. })
    })
    .await;
    assert!(matches!(failed, LifecycleNotice::SetupFailed { attempt: 0, .. }));

    let status = wait_for_phase(&session, SessionPhase::Connected).await;
    assert_eq!(status.retry_attempt, 0);
    assert_eq!(session.transport.establish_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_forwarded_with_handle() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Manual);
    let mut session = start_test_session(transport, create_test_config(3), None).await;
    wait_for_sessions(&session.transport, 1).await;

    session
        .transport
        .deliver_text("15550002222@s.chat", "!ping", BatchKind::Notify)
        .await;

    let job = tokio::time::timeout(WAIT, session.jobs.recv())
        .await
        .expect("timed out waiting for job")
        .expect("job channel closed");
    assert_eq!(job.batch.kind, BatchKind::Notify);
    assert_eq!(job.batch.messages.len(), 1);
    assert_eq!(job.batch.messages[0].chat_id, "15550002222@s.chat");
}

#[tokio::test(start_paused = true)]
async fn test_events_after_close_are_ignored() {
    let transport = MemoryTransport::new().with_pairing(PairingMode::Manual);
    let mut session = start_test_session(
        transport,
        create_test_config(3),
        Some(paired_credentials()),
    )
    .await;
    wait_for_sessions(&session.transport, 1).await;

    session
        .transport
        .close_current(DisconnectReason::LoggedOut)
        .await;
    next_notice(&mut session.notices, |notice| {
        *notice == LifecycleNotice::CredentialsWiped
    })
    .await;

    // The closed session is detached; a late credential write must not resurrect it
    session
        .transport
        .emit(SessionEvent::Credentials(paired_credentials()))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.store.is_empty().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_tears_everything_down() {
    let session = start_test_session(MemoryTransport::new(), create_test_config(3), None).await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    session.controller.shutdown().await.unwrap();
    let result = session.task.await.unwrap();
    assert!(result.is_ok());

    assert_eq!(session.transport.live_handles(), 0);
    assert_eq!(session.controller.status().phase, SessionPhase::Disconnected);
    assert!(!session.controller.reset().await);
    assert!(matches!(
        session.controller.shutdown().await,
        Err(SessionError::ManagerStopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_backups_rotate_while_connected() {
    let mut config = create_test_config(3);
    config.backup.interval_ms = 1_000;
    let session = start_test_session(
        MemoryTransport::new(),
        config,
        Some(paired_credentials()),
    )
    .await;
    wait_for_phase(&session, SessionPhase::Connected).await;

    tokio::time::timeout(WAIT, async {
        loop {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            if session.store.list_snapshots().await.unwrap().len() >= 3 {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for snapshots");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(session.store.list_snapshots().await.unwrap().len(), 3);
}
