// ABOUTME: Matrix implementation of the gateway's ChatTransport
// ABOUTME: Session open/restore, sync loop, inbound conversion and recipient resolution for bridged phones

pub mod client;

pub use client::{create_client, create_dm_room, StoredSession};

use async_trait::async_trait;
use fieldbot_core::config::MatrixConfig;
use fieldbot_core::session::Credential;
use fieldbot_core::traits::{
    ChatTransport, ChatUser, DisconnectReason, Identity, InboundMessage, MessageBody, OpenOutcome,
    OpenSession, TransportError, TransportEvent,
};
use fieldbot_core::workflow::normalize_phone;
use matrix_sdk::{
    config::SyncSettings,
    event_handler::EventHandlerHandle,
    room::Room,
    ruma::{
        events::room::{
            member::StrippedRoomMemberEvent,
            message::{MessageType, OriginalSyncRoomMessageEvent, RoomMessageEventContent},
        },
        OwnedRoomId, OwnedUserId,
    },
    Client, RoomState,
};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PROVISIONING_HINT: &str =
    "No stored Matrix credential; set MATRIX_PASSWORD (or matrix.password) so the bot can log in";

/// The live client plus everything that must be torn down with it
struct LiveSession {
    client: Client,
    sync_task: JoinHandle<()>,
    handlers: Vec<EventHandlerHandle>,
}

pub struct MatrixTransport {
    config: MatrixConfig,
    country_code: String,
    store_passphrase: Option<String>,
    live: Mutex<Option<LiveSession>>,
}

impl MatrixTransport {
    pub fn new(config: MatrixConfig, country_code: impl Into<String>) -> Self {
        Self {
            config,
            country_code: country_code.into(),
            store_passphrase: None,
            live: Mutex::new(None),
        }
    }

    /// Encrypt the local sqlite state and crypto store with this passphrase
    pub fn with_store_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.store_passphrase = passphrase;
        self
    }

    fn client(&self) -> Result<Client, TransportError> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|live| live.client.clone())
            .ok_or_else(|| TransportError::Network("no open Matrix session".to_string()))
    }

    fn register_message_handler(
        &self,
        client: &Client,
        tx: mpsc::Sender<TransportEvent>,
        bot_user_id: String,
    ) -> EventHandlerHandle {
        let prefix = self.config.puppet_prefix.clone();
        let bridge_server = self.config.bridge_server_name().to_string();

        client.add_event_handler(move |event: OriginalSyncRoomMessageEvent, room: Room| {
            let tx = tx.clone();
            let bot_user_id = bot_user_id.clone();
            let prefix = prefix.clone();
            let bridge_server = bridge_server.clone();
            async move {
                if room.state() != RoomState::Joined {
                    return;
                }

                let sender_id = event.sender.to_string();
                let mut sender = ChatUser::new(sender_id.clone());
                if let Some(phone) = phone_from_puppet(&sender_id, &prefix, &bridge_server) {
                    sender = sender.with_phone(phone);
                }
                if let Ok(Some(member)) = room.get_member(&event.sender).await {
                    if let Some(name) = member.display_name() {
                        sender = sender.with_name(name);
                    }
                }

                let message = InboundMessage {
                    chat_id: room.room_id().to_string(),
                    sender,
                    body: message_body(&event.content.msgtype),
                    is_self: sender_id == bot_user_id,
                    event_id: event.event_id.to_string(),
                    timestamp: {
                        let millis: u64 = event.origin_server_ts.0.into();
                        (millis / 1000) as i64
                    },
                };

                if tx.send(TransportEvent::Message(message)).await.is_err() {
                    tracing::debug!("Inbound event receiver dropped");
                }
            }
        })
    }

    /// Bridged contacts open a DM by inviting the bot; join those automatically
    fn register_invite_handler(&self, client: &Client) -> EventHandlerHandle {
        let bridge_server = self.config.bridge_server_name().to_string();

        client.add_event_handler(
            move |event: StrippedRoomMemberEvent, client: Client, room: Room| {
                let bridge_server = bridge_server.clone();
                async move {
                    if client.user_id() != Some(&*event.state_key) {
                        return;
                    }
                    if room.state() != RoomState::Invited {
                        return;
                    }

                    let inviter = event.sender.as_str();
                    if event.sender.server_name().as_str() != bridge_server {
                        tracing::warn!(
                            room_id = %room.room_id(),
                            inviter = %inviter,
                            "Ignoring room invite from outside the bridge"
                        );
                        return;
                    }

                    match room.join().await {
                        Ok(_) => tracing::info!(room_id = %room.room_id(), inviter = %inviter, "Joined room"),
                        Err(e) => tracing::error!(
                            error = %e,
                            room_id = %room.room_id(),
                            "Failed to join room"
                        ),
                    }
                }
            },
        )
    }

    async fn dm_room_for(&self, client: &Client, user_id: &str) -> Result<Option<String>, TransportError> {
        let Ok(user_id) = user_id.parse::<OwnedUserId>() else {
            return Ok(None);
        };
        if let Some(room) = client.get_dm_room(&user_id) {
            return Ok(Some(room.room_id().to_string()));
        }
        match create_dm_room(client, &user_id).await {
            Ok(room_id) => Ok(Some(room_id.to_string())),
            Err(e) if client::is_unknown_recipient(e.client_api_error_kind()) => {
                tracing::warn!(user_id = %user_id, error = %e, "Recipient cannot be invited");
                Ok(None)
            }
            Err(e) => Err(TransportError::Network(e.to_string())),
        }
    }
}

#[async_trait]
impl ChatTransport for MatrixTransport {
    fn platform_id(&self) -> &'static str {
        "matrix"
    }

    async fn open(&self, credential: Option<Credential>) -> Result<OpenOutcome, TransportError> {
        self.close().await;

        let stored = match credential {
            Some(ref credential) => Some(StoredSession::from_credential(credential)?),
            None if self.config.password.is_none() => {
                return Ok(OpenOutcome::NeedsProvisioning {
                    hint: PROVISIONING_HINT.to_string(),
                });
            }
            None => None,
        };

        let client = create_client(
            &self.config.home_server,
            &self.config.user_id,
            &self.config.device_name,
            self.store_passphrase.as_deref(),
        )
        .await
        .map_err(|e| TransportError::Network(format!("{:#}", e)))?;

        let session = match (stored, self.config.password.as_deref()) {
            (Some(stored), _) => {
                client::restore(&client, &stored).await?;
                stored
            }
            (None, Some(password)) => {
                client::login_with_password(
                    &client,
                    &self.config.user_id,
                    password,
                    &self.config.device_name,
                )
                .await?
            }
            (None, None) => {
                return Ok(OpenOutcome::NeedsProvisioning {
                    hint: PROVISIONING_HINT.to_string(),
                })
            }
        };

        // Initial sync establishes encryption; history it returns is not replayed as commands
        let response = client
            .sync_once(SyncSettings::default())
            .await
            .map_err(|e| client::classify_sdk(&e))?;

        let bot_user_id = client
            .user_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| session.user_id.clone());
        let name = client.account().get_display_name().await.ok().flatten();

        let (tx, rx) = mpsc::channel(256);
        let handlers = vec![
            self.register_message_handler(&client, tx.clone(), bot_user_id.clone()),
            self.register_invite_handler(&client),
        ];

        let sync_client = client.clone();
        let next_batch = response.next_batch;
        let sync_task = tokio::spawn(async move {
            let settings = SyncSettings::default().token(next_batch);
            let reason = match sync_client.sync(settings).await {
                Ok(()) => DisconnectReason::Network("sync loop ended".to_string()),
                Err(e) => DisconnectReason::from(client::classify_sdk(&e)),
            };
            tracing::warn!(reason = %reason, "Matrix sync loop stopped");
            let _ = tx.send(TransportEvent::Closed(reason)).await;
        });

        *self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(LiveSession {
            client,
            sync_task,
            handlers,
        });

        Ok(OpenOutcome::Open(OpenSession {
            identity: Identity {
                id: bot_user_id,
                name,
                phone: self.config.phone.clone(),
            },
            credential: session.to_credential()?,
            events: rx,
        }))
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        let client = self.client()?;
        let room_id: OwnedRoomId = chat_id
            .parse()
            .map_err(|_| TransportError::Network(format!("invalid room id {}", chat_id)))?;
        let room = client
            .get_room(&room_id)
            .ok_or_else(|| TransportError::Network(format!("room not found: {}", chat_id)))?;

        room.send(RoomMessageEventContent::text_plain(text))
            .await
            .map_err(|e| client::classify_sdk(&e))?;
        Ok(())
    }

    async fn keep_alive(&self) -> Result<(), TransportError> {
        let client = self.client()?;
        client
            .whoami()
            .await
            .map(|_| ())
            .map_err(|e| client::classify_http(&e))
    }

    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, TransportError> {
        let client = self.client()?;
        match classify_recipient(recipient) {
            Recipient::Room(room_id) => {
                let Ok(room_id) = room_id.parse::<OwnedRoomId>() else {
                    return Ok(None);
                };
                Ok(client
                    .get_room(&room_id)
                    .filter(|room| room.state() == RoomState::Joined)
                    .map(|room| room.room_id().to_string()))
            }
            Recipient::User(user_id) => self.dm_room_for(&client, &user_id).await,
            Recipient::Phone(raw) => {
                let Some(phone) = normalize_phone(&raw, &self.country_code) else {
                    return Ok(None);
                };
                let user_id = puppet_user_id(
                    &phone,
                    &self.config.puppet_prefix,
                    self.config.bridge_server_name(),
                );
                self.dm_room_for(&client, &user_id).await
            }
            Recipient::Unknown => Ok(None),
        }
    }

    async fn close(&self) {
        let live = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(live) = live {
            live.sync_task.abort();
            for handle in live.handlers {
                live.client.remove_event_handler(handle);
            }
            tracing::debug!("Matrix session closed");
        }
    }
}

/// Text-bearing shapes map to text; media keeps only its caption
pub fn message_body(msgtype: &MessageType) -> MessageBody {
    fn media(kind: &str, caption: Option<&str>) -> MessageBody {
        MessageBody::Media {
            kind: kind.to_string(),
            caption: caption.map(str::to_string),
        }
    }

    match msgtype {
        MessageType::Text(text) => MessageBody::Text(text.body.clone()),
        MessageType::Emote(emote) => MessageBody::Text(emote.body.clone()),
        MessageType::Notice(notice) => MessageBody::Notice(notice.body.clone()),
        MessageType::Image(content) => media("image", content.caption()),
        MessageType::File(content) => media("file", content.caption()),
        MessageType::Video(content) => media("video", content.caption()),
        MessageType::Audio(content) => media("audio", content.caption()),
        other => MessageBody::Unsupported(other.msgtype().to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Room(String),
    User(String),
    Phone(String),
    Unknown,
}

pub fn classify_recipient(recipient: &str) -> Recipient {
    let recipient = recipient.trim();
    if recipient.starts_with('!') {
        Recipient::Room(recipient.to_string())
    } else if recipient.starts_with('@') {
        Recipient::User(recipient.to_string())
    } else if !recipient.is_empty()
        && recipient.chars().any(|c| c.is_ascii_digit())
        && recipient
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'))
    {
        Recipient::Phone(recipient.to_string())
    } else {
        Recipient::Unknown
    }
}

/// `@<prefix><digits>:<server>` for a bridged phone contact
pub fn puppet_user_id(phone: &str, prefix: &str, server: &str) -> String {
    format!("@{}{}:{}", prefix, phone, server)
}

/// Inverse of [`puppet_user_id`]; None for anyone who is not a bridged phone
pub fn phone_from_puppet(user_id: &str, prefix: &str, server: &str) -> Option<String> {
    let (localpart, user_server) = user_id.strip_prefix('@')?.split_once(':')?;
    if user_server != server {
        return None;
    }
    let digits = localpart.strip_prefix(prefix)?;
    (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then(|| digits.to_string())
}
