// ABOUTME: Routes inbound chat messages to command handlers and sends exactly one reply each.
// ABOUTME: Per-sender serial queues keep reply order; built-ins (ping/help/status/info) live here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::commands::{parse_message, Command, CommandRegistry, ParseResult};
use crate::config::CommandsConfig;
use crate::connection::Messenger;
use crate::metrics::Counters;
use crate::status::{format_uptime, StatusSource};
use crate::traits::InboundMessage;

pub const GENERIC_ERROR_REPLY: &str =
    "Sorry, something went wrong while handling that command. Please try again later.";

const BUILTIN_USAGE: [(&str, &str); 4] = [
    ("ping", "ping - check that the bot is alive"),
    ("help", "help - show this list"),
    ("status", "status - connection status and uptime"),
    ("info", "info - bot account details"),
];

pub struct CommandRouter {
    registry: Arc<CommandRegistry>,
    messenger: Arc<dyn Messenger>,
    status: Arc<dyn StatusSource>,
    counters: Arc<Counters>,
    marker: char,
    self_allowed: HashSet<String>,
    platform: String,
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>,
}

impl CommandRouter {
    pub fn new(
        registry: CommandRegistry,
        messenger: Arc<dyn Messenger>,
        status: Arc<dyn StatusSource>,
        counters: Arc<Counters>,
        config: &CommandsConfig,
        platform: impl Into<String>,
    ) -> Self {
        if registry.is_empty() {
            tracing::warn!("No command handlers registered; only built-ins will answer");
        }
        Self {
            registry: Arc::new(registry),
            messenger,
            status,
            counters,
            marker: config.marker.chars().next().unwrap_or('!'),
            self_allowed: config
                .self_allowed
                .iter()
                .map(|verb| verb.trim_start_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
                .collect(),
            platform: platform.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Drain the inbound stream until the connection manager goes away
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.enqueue(message);
        }
        tracing::info!("Inbound stream closed; command router stopped");
    }

    /// Queue a message behind earlier ones from the same sender
    pub fn enqueue(self: &Arc<Self>, message: InboundMessage) {
        let key = message.sender.id.clone();
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let message = match queues.get(&key) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive; cannot fail
        let _ = tx.send(message);
        queues.insert(key.clone(), tx);
        drop(queues);

        let router = Arc::clone(self);
        tokio::spawn(async move { router.drain(key, rx).await });
    }

    /// Number of senders with a worker running
    pub fn active_peers(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    async fn drain(&self, key: String, mut rx: mpsc::UnboundedReceiver<InboundMessage>) {
        loop {
            let next = {
                let mut queues = self
                    .queues
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match rx.try_recv() {
                    Ok(message) => Some(message),
                    Err(_) => {
                        // Removal under the lock: enqueue never sees a dead sender
                        queues.remove(&key);
                        None
                    }
                }
            };
            match next {
                Some(message) => self.handle(message).await,
                None => break,
            }
        }
    }

    /// Handle one message to completion, including its reply
    pub async fn handle(&self, message: InboundMessage) {
        let Some(text) = message.body.extract_text() else {
            tracing::trace!(event = %message.event_id, "Ignoring message without text");
            return;
        };

        let command = match parse_message(text, self.marker) {
            ParseResult::Command(command) => command.from_sender(&message.sender, &message.chat_id),
            ParseResult::Message(_) => {
                tracing::debug!(
                    sender = %message.sender.id,
                    chat = %message.chat_id,
                    "Ignoring non-command message"
                );
                return;
            }
            ParseResult::Ignore => return,
        };

        if message.is_self && !self.self_allowed.contains(command.name()) {
            tracing::trace!(verb = %command.verb, "Ignoring own command outside allow-list");
            return;
        }

        self.counters.record_command();
        tracing::info!(
            verb = %command.verb,
            args = command.args.len(),
            sender = %message.sender.id,
            "Dispatching command"
        );

        let reply = self.dispatch(command).await;
        self.reply(&message.chat_id, &reply).await;
    }

    async fn dispatch(&self, command: Command) -> String {
        let name = self.registry.canonical(command.name()).to_string();

        if let Some(reply) = self.builtin(&name) {
            self.counters.record_verb(&name);
            return reply;
        }

        let Some(handler) = self.registry.get(&name) else {
            tracing::debug!(verb = %command.verb, "Unrecognized command");
            return format!(
                "Unrecognized command {}. Send {}help for the list of commands.",
                command.verb, self.marker
            );
        };
        self.counters.record_verb(&name);

        // Own task so a panicking handler cannot take the router down
        let verb = command.verb.clone();
        match tokio::spawn(async move { handler.handle(command).await }).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::error!(verb = %verb, error = ?e, "Command handler failed");
                crate::metrics::record_error("handler");
                GENERIC_ERROR_REPLY.to_string()
            }
            Err(e) => {
                tracing::error!(verb = %verb, panicked = e.is_panic(), error = %e, "Command handler aborted");
                crate::metrics::record_error("handler_panic");
                GENERIC_ERROR_REPLY.to_string()
            }
        }
    }

    fn builtin(&self, name: &str) -> Option<String> {
        match name {
            "ping" => Some("pong".to_string()),
            "help" => Some(self.help()),
            "status" => {
                let snapshot = self.status.snapshot();
                Some(format!(
                    "Connection: {}\nUptime: {}\nCommands handled: {}",
                    snapshot.status,
                    format_uptime(snapshot.uptime_seconds),
                    snapshot.command_count
                ))
            }
            "info" => {
                let snapshot = self.status.snapshot();
                let account = match snapshot.user {
                    Some(user) => match user.name {
                        Some(name) => format!("{} ({})", user.id, name),
                        None => user.id,
                    },
                    None => "not connected".to_string(),
                };
                Some(format!(
                    "fieldbot {} on {}\nAccount: {}",
                    env!("CARGO_PKG_VERSION"),
                    self.platform,
                    account
                ))
            }
            _ => None,
        }
    }

    fn help(&self) -> String {
        let mut lines = vec!["Available commands:".to_string()];
        lines.extend(
            BUILTIN_USAGE
                .iter()
                .map(|(_, usage)| format!("{}{}", self.marker, usage)),
        );
        lines.extend(self.registry.usage_lines().map(str::to_string));
        lines.join("\n")
    }

    /// Send the reply; on failure try one generic error reply
    async fn reply(&self, chat_id: &str, text: &str) {
        let Err(e) = self.messenger.send(chat_id, text).await else {
            return;
        };
        tracing::warn!(chat = %chat_id, error = %e, "Reply delivery failed");
        if let Err(e) = self.messenger.send(chat_id, GENERIC_ERROR_REPLY).await {
            tracing::error!(chat = %chat_id, error = %e, "Error reply also undeliverable");
        }
    }
}
