use crate::credentials::Credentials;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

/// Identity of one established session handle
pub type HandleId = Uuid;

/// Settings handed to the transport on every `establish` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server endpoint; `None` lets the transport pick its own default
    pub endpoint: Option<Url>,
    pub connect_timeout_ms: u64,
    /// Name this client announces when pairing a new device
    pub device_name: String,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_ms: 20_000,
            device_name: "chatlink".to_string(),
        }
    }
}

/// Why a session was closed, classified from the transport status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The account unlinked this device (401)
    LoggedOut,
    /// Credentials were rejected (403)
    Unauthorized,
    /// The server closed the connection (428)
    ConnectionClosed,
    /// The connection dropped or timed out (408)
    ConnectionLost,
    /// Another client took over the session (440)
    ConnectionReplaced,
    /// Close without a status code
    Unknown,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Unauthorized,
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::ConnectionLost,
            Some(440) => Self::ConnectionReplaced,
            Some(code) => Self::Other(code),
            None => Self::Unknown,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::Unauthorized => Some(403),
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost => Some(408),
            Self::ConnectionReplaced => Some(440),
            Self::Unknown => None,
            Self::Other(code) => Some(*code),
        }
    }

    /// Stored credentials are no longer accepted and must be wiped
    pub fn is_auth_invalid(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::Unauthorized)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOut => write!(f, "logged out"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::ConnectionClosed => write!(f, "connection closed by server"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::ConnectionReplaced => write!(f, "connection replaced"),
            Self::Unknown => write!(f, "unknown"),
            Self::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Connection-level signals from an active session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionUpdate {
    /// A new pairing payload (e.g. QR contents) must be shown to the user
    HandshakeArtifact(String),
    Opened,
    Closed {
        reason: DisconnectReason,
        detail: Option<String>,
    },
}

/// Whether a batch carries live notifications or replayed history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    Notify,
    HistorySync,
}

/// Payload variants that may carry text, in extraction priority order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image_caption: Option<String>,
    pub video_caption: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation: Some(text.into()),
            ..Default::default()
        }
    }

    /// First non-empty text variant, or `None` for non-text payloads
    pub fn extract_text(&self) -> Option<&str> {
        [
            &self.conversation,
            &self.extended_text,
            &self.image_caption,
            &self.video_caption,
        ]
        .into_iter()
        .filter_map(|variant| variant.as_deref())
        .find(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Conversation the message arrived in; replies go here
    pub chat_id: String,
    pub from_me: bool,
    pub content: Option<MessageContent>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(chat_id: impl Into<String>, content: Option<MessageContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            from_me: false,
            content,
            received_at: Utc::now(),
        }
    }

    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(chat_id, Some(MessageContent::text(text)))
    }

    pub fn is_broadcast(&self) -> bool {
        self.chat_id.ends_with("@broadcast")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageBatch {
    pub kind: BatchKind,
    pub messages: Vec<InboundMessage>,
}

/// Everything a session handle reports back to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(ConnectionUpdate),
    Credentials(Credentials),
    Messages(MessageBatch),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaSource {
    Url(Url),
    Bytes(Vec<u8>),
}

/// Outbound content; a `Sequence` is delivered one item at a time, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutgoingPayload {
    Text(String),
    Image {
        media: MediaSource,
        caption: Option<String>,
    },
    Sticker {
        media: MediaSource,
    },
    Video {
        media: MediaSource,
        caption: Option<String>,
    },
    Audio {
        media: MediaSource,
    },
    Sequence(Vec<OutgoingPayload>),
}

impl OutgoingPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Expand nested sequences into the individual payloads to send
    pub fn flatten(self) -> Vec<OutgoingPayload> {
        match self {
            Self::Sequence(items) => items.into_iter().flat_map(Self::flatten).collect(),
            single => vec![single],
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SetupError {
    #[error("session setup timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport rejected session setup: {0}")]
    Rejected(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("send to {target} failed: {message}")]
    SendFailed { target: String, message: String },
    #[error("logout failed: {0}")]
    LogoutFailed(String),
}

/// A freshly established session: the handle plus its event stream
pub struct Established {
    pub handle: Arc<dyn SessionHandle>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Session/transport collaborator that opens new sessions
pub trait Transport: Send + Sync {
    /// Open a session using the given credential material
    ///
    /// The returned receiver yields connection, credential and message
    /// events until the session is torn down. Dropping it detaches the
    /// caller from the session.
    fn establish<'a>(
        &'a self,
        credentials: Credentials,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Established, SetupError>>;

    /// Get transport name/identifier
    fn transport_name(&self) -> &'static str;
}

/// Live session created by a [`Transport`]
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> HandleId;

    /// Send one non-sequence payload
    async fn send(&self, target: &str, payload: OutgoingPayload) -> Result<(), TransportError>;

    /// End the session gracefully. Callers treat failures as best-effort.
    async fn logout(&self) -> Result<(), TransportError>;
}

/// Send a payload, expanding sequences into individual sends in order.
///
/// Returns the number of messages sent. Stops at the first failure.
pub async fn send_payload(
    handle: &dyn SessionHandle,
    target: &str,
    payload: OutgoingPayload,
) -> Result<usize, TransportError> {
    let mut sent = 0;
    for item in payload.flatten() {
        handle.send(target, item).await?;
        sent += 1;
    }
    Ok(sent)
}
