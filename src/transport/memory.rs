//! In-process transport.
//!
//! Stands in for a real chat transport: sessions live entirely in memory,
//! establish outcomes can be scripted, and events can be injected into the
//! most recent session. `chatlink run` uses it for local runs and the test
//! suites use it to drive the lifecycle manager.

use super::types::*;
use crate::credentials::Credentials;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// How a freshly established memory session reaches `Opened`
#[derive(Debug, Clone, PartialEq)]
pub enum PairingMode {
    /// Emit `Opened` right away
    Immediate,
    /// Registered credentials open immediately; otherwise emit a handshake
    /// artifact and, if `auto_pair_after` is set, pair and open after that delay
    Handshake { auto_pair_after: Option<Duration> },
    /// Emit nothing; the caller drives the session through [`MemoryTransport::emit`]
    Manual,
}

/// Scripted result of one `establish` call
#[derive(Debug, Clone)]
pub enum EstablishOutcome {
    Succeed,
    Fail(SetupError),
}

/// A payload recorded by a memory session handle
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub handle: HandleId,
    pub target: String,
    pub payload: OutgoingPayload,
}

#[derive(Default)]
struct Shared {
    establish_attempts: AtomicUsize,
    sessions_established: AtomicUsize,
    live_handles: AtomicUsize,
    max_live_handles: AtomicUsize,
    script: Mutex<VecDeque<EstablishOutcome>>,
    current: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    sent: Mutex<Vec<SentMessage>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryTransport {
    shared: Arc<Shared>,
    pairing: PairingMode,
    event_buffer: usize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            pairing: PairingMode::Immediate,
            event_buffer: 64,
        }
    }

    pub fn with_pairing(mut self, pairing: PairingMode) -> Self {
        self.pairing = pairing;
        self
    }

    /// Queue the outcome of a future `establish` call; unscripted calls succeed
    pub fn push_outcome(&self, outcome: EstablishOutcome) {
        lock(&self.shared.script).push_back(outcome);
    }

    /// Make the next `count` establish calls fail with `error`
    pub fn fail_next(&self, count: usize, error: SetupError) {
        let mut script = lock(&self.shared.script);
        for _ in 0..count {
            script.push_back(EstablishOutcome::Fail(error.clone()));
        }
    }

    /// Deliver an event to the most recently established session.
    ///
    /// Returns false when there is no session or its owner stopped listening.
    pub async fn emit(&self, event: SessionEvent) -> bool {
        let sender = lock(&self.shared.current).clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn close_current(&self, reason: DisconnectReason) -> bool {
        self.emit(SessionEvent::Connection(ConnectionUpdate::Closed {
            reason,
            detail: None,
        }))
        .await
    }

    /// Deliver a single text message as a batch of the given kind
    pub async fn deliver_text(&self, chat_id: &str, text: &str, kind: BatchKind) -> bool {
        self.emit(SessionEvent::Messages(MessageBatch {
            kind,
            messages: vec![InboundMessage::text(chat_id, text)],
        }))
        .await
    }

    pub fn establish_attempts(&self) -> usize {
        self.shared.establish_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_established(&self) -> usize {
        self.shared.sessions_established.load(Ordering::SeqCst)
    }

    /// Handles that were established and have been neither logged out nor dropped
    pub fn live_handles(&self) -> usize {
        self.shared.live_handles.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.shared.max_live_handles.load(Ordering::SeqCst)
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.shared.sent).clone()
    }

    pub fn take_sent_messages(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *lock(&self.shared.sent))
    }

    fn open_session(
        &self,
        credentials: &Credentials,
        config: &TransportConfig,
        events: &mpsc::Sender<SessionEvent>,
    ) {
        match &self.pairing {
            PairingMode::Immediate => {
                let _ = events.try_send(SessionEvent::Connection(ConnectionUpdate::Opened));
            }
            PairingMode::Handshake { auto_pair_after } => {
                if credentials.is_registered() {
                    let _ = events.try_send(SessionEvent::Connection(ConnectionUpdate::Opened));
                    return;
                }

                let token: u64 = rand::rng().random();
                let artifact = format!("{:016x},{}", token, config.device_name);
                let _ = events.try_send(SessionEvent::Connection(
                    ConnectionUpdate::HandshakeArtifact(artifact),
                ));

                if let Some(delay) = *auto_pair_after {
                    let events = events.clone();
                    let account_id = format!("{}@s.chat", token % 10_000_000_000);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        info!("Memory transport paired account {}", account_id);
                        let paired = Credentials::paired(account_id);
                        if events.send(SessionEvent::Credentials(paired)).await.is_ok() {
                            let _ = events
                                .send(SessionEvent::Connection(ConnectionUpdate::Opened))
                                .await;
                        }
                    });
                }
            }
            PairingMode::Manual => {}
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn establish<'a>(
        &'a self,
        credentials: Credentials,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Established, SetupError>> {
        Box::pin(async move {
            self.shared.establish_attempts.fetch_add(1, Ordering::SeqCst);

            let outcome = lock(&self.shared.script).pop_front();
            if let Some(EstablishOutcome::Fail(error)) = outcome {
                debug!("Memory transport failing establish: {}", error);
                return Err(error);
            }

            let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
            let handle = MemoryHandle::new(self.shared.clone());
            *lock(&self.shared.current) = Some(events_tx.clone());
            self.shared.sessions_established.fetch_add(1, Ordering::SeqCst);

            self.open_session(&credentials, config, &events_tx);

            Ok(Established {
                handle: Arc::new(handle),
                events: events_rx,
            })
        })
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryHandle {
    id: HandleId,
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl MemoryHandle {
    fn new(shared: Arc<Shared>) -> Self {
        let live = shared.live_handles.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_live_handles.fetch_max(live, Ordering::SeqCst);
        Self {
            id: Uuid::new_v4(),
            shared,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.shared.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl SessionHandle for MemoryHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    async fn send(&self, target: &str, payload: OutgoingPayload) -> Result<(), TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        lock(&self.shared.sent).push(SentMessage {
            handle: self.id,
            target: target.to_string(),
            payload,
        });
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        debug!("Memory session {} logged out", self.id);
        self.release();
        Ok(())
    }
}
