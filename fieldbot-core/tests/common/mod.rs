// ABOUTME: Shared test doubles: a scripted chat transport and a recording messenger
// ABOUTME: Used by the connection, router, workflow and outbox integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use fieldbot_core::connection::{Messenger, SendError};
use fieldbot_core::session::{Credential, CredentialCipher, SessionStore};
use fieldbot_core::status::{SnapshotUser, StatusSnapshot, StatusSource};
use fieldbot_core::traits::{
    ChatTransport, ChatUser, DisconnectReason, Identity, InboundMessage, MessageBody, OpenOutcome,
    OpenSession, TransportError, TransportEvent,
};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const BOT_ID: &str = "@fieldbot:example.org";

// =============================================================================
// Scripted transport
// =============================================================================

/// What the next `open()` call does
#[derive(Debug, Clone)]
pub enum Script {
    Open,
    Fail(TransportError),
    NeedsProvisioning,
}

#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<Option<Credential>>>,
    session: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<(String, String)>>,
    keep_alive_fails: AtomicBool,
    keep_alives: AtomicUsize,
    closes: AtomicUsize,
}

impl MockTransport {
    pub fn new(script: impl IntoIterator<Item = Script>) -> Arc<Self> {
        let transport = Self::default();
        transport.script.lock().unwrap().extend(script);
        Arc::new(transport)
    }

    pub fn push_script(&self, step: Script) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Credentials passed to each `open()` call
    pub fn opens(&self) -> Vec<Option<Credential>> {
        self.opens.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    pub fn fail_keep_alive(&self, fail: bool) {
        self.keep_alive_fails.store(fail, Ordering::SeqCst);
    }

    /// End the live session from the server side
    pub async fn drop_session(&self, reason: DisconnectReason) {
        let tx = self.session.lock().unwrap().clone();
        tx.expect("no open session")
            .send(TransportEvent::Closed(reason))
            .await
            .unwrap();
    }

    pub async fn deliver(&self, message: InboundMessage) {
        let tx = self.session.lock().unwrap().clone();
        tx.expect("no open session")
            .send(TransportEvent::Message(message))
            .await
            .unwrap();
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    fn platform_id(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, credential: Option<Credential>) -> Result<OpenOutcome, TransportError> {
        let attempt = {
            let mut opens = self.opens.lock().unwrap();
            opens.push(credential.clone());
            opens.len()
        };
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Fail(TransportError::Network("script exhausted".into())));

        match step {
            Script::Fail(e) => Err(e),
            Script::NeedsProvisioning => Ok(OpenOutcome::NeedsProvisioning {
                hint: "scan the pairing code".into(),
            }),
            Script::Open => {
                let (tx, rx) = mpsc::channel(64);
                *self.session.lock().unwrap() = Some(tx);
                let credential = credential
                    .unwrap_or_else(|| Credential::new(format!("token-{}", attempt).into_bytes()));
                Ok(OpenOutcome::Open(OpenSession {
                    identity: Identity {
                        id: BOT_ID.into(),
                        name: Some("Field Bot".into()),
                        phone: None,
                    },
                    credential,
                    events: rx,
                }))
            }
        }
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), TransportError> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        if self.keep_alive_fails.load(Ordering::SeqCst) {
            Err(TransportError::Network("keep-alive refused".into()))
        } else {
            Ok(())
        }
    }

    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, TransportError> {
        Ok(Some(format!("dm:{}", recipient)))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.session.lock().unwrap().take();
    }
}

pub fn session_store(dir: &Path) -> Arc<SessionStore> {
    Arc::new(SessionStore::new(
        dir.join("credential.enc"),
        CredentialCipher::new(&[3u8; 32]),
    ))
}

// =============================================================================
// Recording messenger
// =============================================================================

#[derive(Default)]
pub struct RecordingMessenger {
    open: AtomicBool,
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    failing_sends: AtomicUsize,
    close_after: Mutex<Option<usize>>,
    unresolvable: Mutex<HashSet<String>>,
}

impl RecordingMessenger {
    pub fn open() -> Arc<Self> {
        let messenger = Self::default();
        messenger.open.store(true, Ordering::SeqCst);
        Arc::new(messenger)
    }

    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Next `n` sends fail with a transport error
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Connection drops after `n` successful sends
    pub fn close_after(&self, n: usize) {
        *self.close_after.lock().unwrap() = Some(n);
    }

    pub fn mark_unresolvable(&self, recipient: &str) {
        self.unresolvable
            .lock()
            .unwrap()
            .insert(recipient.to_string());
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait (on the tokio clock) until `n` messages were sent
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        for _ in 0..1000 {
            if self.sent.lock().unwrap().len() >= n {
                return self.texts();
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {} sent messages, got {:?}", n, self.texts());
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, SendError> {
        if !self.is_open() {
            return Err(SendError::Unavailable);
        }
        if self.unresolvable.lock().unwrap().contains(recipient) {
            return Ok(None);
        }
        Ok(Some(format!("dm:{}", recipient)))
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Unavailable);
        }
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(SendError::Transport(TransportError::Network(
                "injected failure".into(),
            )));
        }

        let count = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id.to_string(), text.to_string()));
            sent.len()
        };
        if let Some(limit) = *self.close_after.lock().unwrap() {
            if count >= limit {
                self.set_open(false);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Status stub and message builders
// =============================================================================

pub struct StubStatus;

impl StatusSource for StubStatus {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: true,
            user: Some(SnapshotUser {
                id: BOT_ID.into(),
                name: Some("Field Bot".into()),
                phone: None,
            }),
            status: "open".into(),
            last_update: chrono::Utc::now(),
            uptime_seconds: 3_725,
            command_count: 0,
            messages: Default::default(),
        }
    }
}

/// Text message from a bridged phone contact
pub fn text_from(phone: &str, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: format!("!dm-{}:example.org", phone),
        sender: ChatUser::new(format!("@whatsapp_{}:bridge.example.org", phone))
            .with_phone(phone)
            .with_name(format!("Tech {}", phone)),
        body: MessageBody::text(text),
        is_self: false,
        event_id: format!("$evt-{}", text.len()),
        timestamp: 0,
    }
}

/// Message sent by the bot's own account
pub fn from_self(text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: "!admin:example.org".into(),
        sender: ChatUser::new(BOT_ID),
        body: MessageBody::text(text),
        is_self: true,
        event_id: "$self".into(),
        timestamp: 0,
    }
}
