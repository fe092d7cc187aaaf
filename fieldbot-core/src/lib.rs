// ABOUTME: Platform-agnostic core of the field-service dispatch gateway
// ABOUTME: Connection lifecycle, command routing, job workflow, outbox, status and alerts

pub mod alerter;
pub mod backoff;
pub mod commands;
pub mod config;
pub mod connection;
pub mod events;
pub mod metrics;
pub mod outbox;
pub mod paths;
pub mod repository;
pub mod router;
pub mod session;
pub mod status;
pub mod store;
pub mod traits;
pub mod workflow;

pub use alerter::AdminAlerter;
pub use commands::{Command, CommandHandler, CommandRegistry};
pub use config::Config;
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, LifecycleEvent, Messenger, SendError,
};
pub use events::{EventHub, LiveEvent};
pub use outbox::{NotificationOutbox, OutboxSettings};
pub use repository::DispatchRepository;
pub use router::CommandRouter;
pub use session::{Credential, CredentialCipher, SessionStore};
pub use status::{StatusPublisher, StatusSampler, StatusSnapshot};
pub use store::SqliteRepository;
pub use traits::{ChatTransport, ChatUser, InboundMessage, MessageBody};
pub use workflow::JobWorkflowService;
