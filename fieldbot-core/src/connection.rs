// ABOUTME: Owns the single chat session: connect/provision/reconnect run loop, heartbeat, sends.
// ABOUTME: Publishes state on a watch channel and lifecycle events on a broadcast channel.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffConfig, BackoffState};
use crate::config::ConnectionConfig;
use crate::metrics::{self, Counters};
use crate::session::SessionStore;
use crate::traits::{
    ChatTransport, DisconnectReason, Identity, InboundMessage, OpenOutcome, OpenSession,
    TransportError, TransportEvent,
};

/// Consecutive keep-alive failures treated as a dropped connection
const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Buffered inbound messages between the session and the router
const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    AwaitingProvisioning,
    LoggedOut,
    /// Auto-retry stopped; needs an operator
    Failed { reason: String },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::AwaitingProvisioning => "awaiting_provisioning",
            Self::LoggedOut => "logged_out",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected { identity: Identity },
    Disconnected { reason: DisconnectReason },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ProvisioningRequired { hint: String },
    LoggedOut,
    Fatal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("chat connection is currently unavailable")]
    Unavailable,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The narrow send surface the rest of the gateway uses
#[async_trait]
pub trait Messenger: Send + Sync {
    fn is_open(&self) -> bool;
    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, SendError>;
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub backoff: BackoffConfig,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pause between a server logout and re-provisioning
    pub logout_restart: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(config: &ConnectionConfig) -> Self {
        let heartbeat_interval = Duration::from_secs(config.heartbeat_secs.max(1));
        Self {
            backoff: BackoffConfig::from(config),
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval.min(Duration::from_secs(10)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            logout_restart: Duration::from_secs(config.logout_restart_secs),
        }
    }
}

/// Next thing the run loop does
enum Step {
    Connect,
    Retry(Duration),
    /// Park until `connect()` is called
    Wait,
    /// Re-provision after a logout
    Restart(Duration),
}

pub struct ConnectionManager {
    transport: Arc<dyn ChatTransport>,
    sessions: Arc<SessionStore>,
    settings: ConnectionSettings,
    counters: Arc<Counters>,
    state: watch::Sender<ConnectionState>,
    identity: Mutex<Option<Identity>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    inbound: mpsc::Sender<InboundMessage>,
    wake: Notify,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// Build the manager and the receiving end of its inbound message stream
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        sessions: Arc<SessionStore>,
        settings: ConnectionSettings,
        counters: Arc<Counters>,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (lifecycle, _) = broadcast::channel(64);
        let manager = Self {
            transport,
            sessions,
            settings,
            counters,
            state,
            identity: Mutex::new(None),
            lifecycle,
            inbound,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        };
        (manager, inbound_rx)
    }

    pub fn platform_id(&self) -> &'static str {
        self.transport.platform_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    /// Identity of the open session
    pub fn identity(&self) -> Option<Identity> {
        self.identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Ask the run loop to connect. A no-op while CONNECTING or OPEN;
    /// otherwise resets backoff. Returns the resulting state.
    pub fn connect(&self) -> ConnectionState {
        if self.cancel.is_cancelled() {
            tracing::debug!("Connect ignored; connection manager shut down");
            return self.state();
        }
        let mut woke = false;
        self.state.send_if_modified(|state| match state {
            ConnectionState::Open | ConnectionState::Connecting => false,
            _ => {
                *state = ConnectionState::Connecting;
                woke = true;
                true
            }
        });
        if woke {
            tracing::info!("Connect requested");
            self.wake.notify_one();
        } else {
            tracing::debug!(state = %self.state(), "Connect ignored; already connecting or open");
        }
        self.state()
    }

    /// Stop the run loop and close the session
    pub async fn disconnect(&self) {
        tracing::info!("Disconnecting chat session");
        self.cancel.cancel();
        self.transport.close().await;
        self.set_identity(None);
        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Connection state changed");
            metrics::set_connection_open(next.is_open());
        }
    }

    fn set_identity(&self, identity: Option<Identity>) {
        *self
            .identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = identity;
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let _ = self.lifecycle.send(event);
    }

    /// The only code path that opens sessions. Runs until `disconnect()`.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = BackoffState::new(self.settings.backoff.clone());
        let mut step = Step::Wait;

        loop {
            step = match step {
                Step::Wait => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {
                            backoff.record_success();
                            Step::Connect
                        }
                    }
                }
                Step::Retry(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => Step::Connect,
                    }
                }
                Step::Restart(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {
                            self.set_state(ConnectionState::Idle);
                            Step::Connect
                        }
                        _ = self.wake.notified() => Step::Connect,
                    }
                }
                Step::Connect => {
                    self.set_state(ConnectionState::Connecting);
                    let credential = self.sessions.current();
                    let had_credential = credential.is_some();
                    let opened = tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        r = tokio::time::timeout(
                            self.settings.connect_timeout,
                            self.transport.open(credential),
                        ) => r,
                    };

                    match opened {
                        Err(_) => self.network_failure(&mut backoff, "connect timed out".to_string()),
                        Ok(Err(TransportError::Network(reason))) => {
                            self.network_failure(&mut backoff, reason)
                        }
                        Ok(Err(TransportError::Auth(reason))) => {
                            self.fatal(format!("authentication failed: {}", reason))
                        }
                        Ok(Err(TransportError::LoggedOut)) if !had_credential => {
                            self.fatal("server rejected fresh provisioning".to_string())
                        }
                        Ok(Err(e @ (TransportError::LoggedOut | TransportError::CorruptCredential(_)))) => {
                            tracing::warn!(error = %e, "Stored credential unusable");
                            self.logged_out().await
                        }
                        Ok(Ok(OpenOutcome::NeedsProvisioning { hint })) => {
                            tracing::warn!(hint = %hint, "Chat identity needs provisioning");
                            self.set_state(ConnectionState::AwaitingProvisioning);
                            self.emit(LifecycleEvent::ProvisioningRequired { hint });
                            Step::Wait
                        }
                        Ok(Ok(OpenOutcome::Open(session))) => {
                            backoff.record_success();
                            match self.serve(session).await {
                                None => break,
                                Some(reason) => {
                                    self.transport.close().await;
                                    self.emit(LifecycleEvent::Disconnected {
                                        reason: reason.clone(),
                                    });
                                    match reason {
                                        DisconnectReason::Network(reason) => {
                                            self.network_failure(&mut backoff, reason)
                                        }
                                        DisconnectReason::LoggedOut => self.logged_out().await,
                                        DisconnectReason::AuthFailed(reason) => {
                                            self.fatal(format!("authentication failed: {}", reason))
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            };
        }

        self.set_identity(None);
        self.set_state(ConnectionState::Idle);
        tracing::info!("Connection run loop stopped");
    }

    fn network_failure(&self, backoff: &mut BackoffState, reason: String) -> Step {
        crate::metrics::record_error("network");
        match backoff.record_failure() {
            Some(delay) => {
                let attempt = backoff.consecutive_failures();
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Chat connection failed; scheduling reconnect"
                );
                metrics::record_reconnect_attempt();
                self.set_state(ConnectionState::Connecting);
                self.emit(LifecycleEvent::ReconnectScheduled { attempt, delay });
                Step::Retry(delay)
            }
            None => self.fatal(format!(
                "gave up after {} consecutive failures: {}",
                backoff.consecutive_failures(),
                reason
            )),
        }
    }

    fn fatal(&self, reason: String) -> Step {
        tracing::error!(reason = %reason, "Chat connection halted; operator action required");
        crate::metrics::record_error("fatal");
        self.set_state(ConnectionState::Failed {
            reason: reason.clone(),
        });
        self.emit(LifecycleEvent::Fatal { reason });
        Step::Wait
    }

    async fn logged_out(&self) -> Step {
        if let Err(e) = self.sessions.wipe() {
            tracing::error!(error = %e, "Failed to wipe chat credential");
        }
        self.transport.close().await;
        self.set_state(ConnectionState::LoggedOut);
        self.emit(LifecycleEvent::LoggedOut);
        tracing::warn!(
            restart_in_secs = self.settings.logout_restart.as_secs(),
            "Logged out by server; will re-provision"
        );
        Step::Restart(self.settings.logout_restart)
    }

    /// Run an open session until it ends. None means cancelled.
    async fn serve(&self, session: OpenSession) -> Option<DisconnectReason> {
        let OpenSession {
            identity,
            credential,
            events,
        } = session;

        if self.sessions.current().as_ref() != Some(&credential) {
            match self.sessions.store(credential) {
                Ok(()) => tracing::info!("New chat credential stored"),
                Err(e) => tracing::error!(error = %e, "Failed to persist new chat credential"),
            }
        }

        tracing::info!(user = %identity.id, platform = self.platform_id(), "Chat session open");
        self.set_identity(Some(identity.clone()));
        self.set_state(ConnectionState::Open);
        self.emit(LifecycleEvent::Connected { identity });

        let reason = self.pump(events).await;
        self.set_identity(None);
        if let Some(reason) = &reason {
            tracing::warn!(reason = %reason, "Chat session closed");
        }
        reason
    }

    /// Forward inbound messages and keep the session alive
    async fn pump(&self, mut events: mpsc::Receiver<TransportEvent>) -> Option<DisconnectReason> {
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        self.counters.record_received();
                        if self.inbound.send(message).await.is_err() {
                            tracing::warn!("Inbound receiver dropped; message discarded");
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => return Some(reason),
                    None => {
                        return Some(DisconnectReason::Network("event stream ended".to_string()))
                    }
                },
                _ = heartbeat.tick() => {
                    let result = tokio::time::timeout(
                        self.settings.heartbeat_timeout,
                        self.transport.keep_alive(),
                    )
                    .await;
                    match result {
                        Ok(Ok(())) => failures = 0,
                        Ok(Err(TransportError::LoggedOut)) => {
                            return Some(DisconnectReason::LoggedOut)
                        }
                        Ok(Err(e)) => {
                            failures += 1;
                            tracing::warn!(error = %e, failures, "Keep-alive failed");
                        }
                        Err(_) => {
                            failures += 1;
                            tracing::warn!(failures, "Keep-alive timed out");
                        }
                    }
                    if failures >= MAX_HEARTBEAT_FAILURES {
                        return Some(DisconnectReason::Network(format!(
                            "{} consecutive keep-alive failures",
                            failures
                        )));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Messenger for ConnectionManager {
    fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    async fn resolve_recipient(&self, recipient: &str) -> Result<Option<String>, SendError> {
        if !self.is_open() {
            return Err(SendError::Unavailable);
        }
        Ok(self.transport.resolve_recipient(recipient).await?)
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Unavailable);
        }
        match self.transport.send_text(chat_id, text).await {
            Ok(()) => {
                self.counters.record_sent();
                Ok(())
            }
            Err(e) => {
                self.counters.record_send_failure();
                tracing::warn!(chat = %chat_id, error = %e, "Send failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(
            ConnectionState::Failed {
                reason: "auth".into()
            }
            .to_string(),
            "failed (auth)"
        );
        assert!(!ConnectionState::Connecting.is_open());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ConnectionSettings::from(&ConnectionConfig::default());
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(2));
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(settings.backoff.max_retries, 5);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_send_error_message() {
        assert_eq!(
            SendError::Unavailable.to_string(),
            "chat connection is currently unavailable"
        );
    }
}
