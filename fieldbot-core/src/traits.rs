// ABOUTME: Transport seam between the gateway core and the chat client library
// ABOUTME: Defines ChatTransport, inbound message shapes, identities and transport errors

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::Credential;

// =============================================================================
// Message Content Types
// =============================================================================

/// Content shapes a chat message can arrive in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Plain or formatted text
    Text(String),
    /// Bot-style notice text
    Notice(String),
    /// Image/file/video/audio; caption is the only text it may carry
    Media {
        kind: String,
        caption: Option<String>,
    },
    /// Reactions, stickers, locations, polls...
    Unsupported(String),
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Text usable as a command, if any
    pub fn extract_text(&self) -> Option<&str> {
        let text = match self {
            Self::Text(text) | Self::Notice(text) => text.as_str(),
            Self::Media {
                caption: Some(caption),
                ..
            } => caption.as_str(),
            Self::Media { caption: None, .. } | Self::Unsupported(_) => return None,
        };
        let trimmed = text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

// =============================================================================
// User Identity
// =============================================================================

/// Identity of the bot account once a session is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// The user who sent an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    /// Unique identifier (e.g., @whatsapp_628111:example.org)
    pub id: String,
    pub display_name: Option<String>,
    /// Phone number when the user is a bridged phone contact
    pub phone: Option<String>,
}

impl ChatUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            phone: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

// =============================================================================
// Incoming Message
// =============================================================================

#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Conversation the reply goes to
    pub chat_id: String,
    pub sender: ChatUser,
    pub body: MessageBody,
    /// Sent by the bot's own account
    pub is_self: bool,
    /// Platform-specific event ID
    pub event_id: String,
    /// Seconds since Unix epoch
    pub timestamp: i64,
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection drop, timeout, DNS... retried with backoff
    #[error("network error: {0}")]
    Network(String),
    /// Login rejected; requires operator action
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Server revoked the credential
    #[error("credential revoked by the server")]
    LoggedOut,
    /// Stored credential could not be used
    #[error("credential is corrupt: {0}")]
    CorruptCredential(String),
}

/// Why an open session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Network(String),
    LoggedOut,
    AuthFailed(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(reason) => write!(f, "network: {}", reason),
            Self::LoggedOut => write!(f, "logged out by server"),
            Self::AuthFailed(reason) => write!(f, "authentication failed: {}", reason),
        }
    }
}

impl From<TransportError> for DisconnectReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Network(reason) => Self::Network(reason),
            TransportError::Auth(reason) => Self::AuthFailed(reason),
            TransportError::LoggedOut | TransportError::CorruptCredential(_) => Self::LoggedOut,
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    Closed(DisconnectReason),
}

/// A live session handed to the connection manager
#[derive(Debug)]
pub struct OpenSession {
    pub identity: Identity,
    /// Credential in use; may be freshly provisioned
    pub credential: Credential,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[derive(Debug)]
pub enum OpenOutcome {
    Open(OpenSession),
    /// No usable credential and no way to provision one automatically
    NeedsProvisioning { hint: String },
}

/// The chat client library, reduced to what the gateway needs.
///
/// Only the connection manager calls this trait. Everything else goes
/// through the manager so there is never a second session.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Platform identifier (e.g., "matrix")
    fn platform_id(&self) -> &'static str;

    /// Open a session from a stored credential, or provision a new one
    async fn open(&self, credential: Option<Credential>) -> Result<OpenOutcome, TransportError>;

    /// Send plain text to a conversation
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError>;

    /// Lightweight liveness probe
    async fn keep_alive(&self) -> Result<(), TransportError>;

    /// Map a recipient (phone, user or conversation ID) to a conversation ID
    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, TransportError>;

    /// Tear down the current session, if any
    async fn close(&self);
}
