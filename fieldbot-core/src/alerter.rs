// ABOUTME: Best-effort lifecycle alerts to the single administrative recipient.
// ABOUTME: Alerts raised while the link is down are held (bounded) and sent on the next connect.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::connection::{LifecycleEvent, Messenger};

/// Undelivered alerts kept for the next connection; the oldest is dropped beyond this
pub const MAX_HELD_ALERTS: usize = 16;

pub struct AdminAlerter {
    messenger: Arc<dyn Messenger>,
    recipient: String,
    held: Mutex<VecDeque<String>>,
}

impl AdminAlerter {
    pub fn new(messenger: Arc<dyn Messenger>, recipient: impl Into<String>) -> Self {
        Self {
            messenger,
            recipient: recipient.into(),
            held: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<LifecycleEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.handle(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Admin alerter lagged behind lifecycle events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Admin alerter stopped");
    }

    /// Alert text for an event, if it warrants one
    pub fn alert_text(event: &LifecycleEvent) -> Option<String> {
        match event {
            LifecycleEvent::Connected { identity } => {
                Some(format!("✅ fieldbot connected as {}", identity.id))
            }
            LifecycleEvent::Disconnected { reason } => {
                Some(format!("⚠️ fieldbot disconnected: {}", reason))
            }
            LifecycleEvent::ReconnectScheduled { attempt, delay } => Some(format!(
                "🔄 fieldbot reconnecting (attempt {}) in {}s",
                attempt,
                delay.as_secs()
            )),
            LifecycleEvent::Fatal { reason } => {
                Some(format!("❌ fieldbot stopped retrying: {}", reason))
            }
            LifecycleEvent::ProvisioningRequired { .. } | LifecycleEvent::LoggedOut => None,
        }
    }

    pub async fn handle(&self, event: &LifecycleEvent) {
        let Some(text) = Self::alert_text(event) else {
            return;
        };
        let connected = matches!(event, LifecycleEvent::Connected { .. });
        if connected {
            self.flush_held().await;
        }
        if let Err(e) = self.alert(&text).await {
            tracing::debug!(error = %e, alert = %text, "Admin alert not delivered");
            // A stale "connected" alert is noise once the link drops again
            if !connected {
                self.hold(text);
            }
        }
    }

    /// Number of alerts waiting for the next connection
    pub fn held_count(&self) -> usize {
        self.held_alerts().len()
    }

    fn held_alerts(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn hold(&self, text: String) {
        let mut held = self.held_alerts();
        if held.len() >= MAX_HELD_ALERTS {
            if let Some(dropped) = held.pop_front() {
                tracing::warn!(alert = %dropped, "Dropping oldest held admin alert");
            }
        }
        held.push_back(text);
    }

    /// Send held alerts oldest-first; stops at the first failure and keeps the rest
    async fn flush_held(&self) {
        let held = self.held_count();
        if held == 0 {
            return;
        }
        tracing::info!(held, "Sending admin alerts held while disconnected");
        loop {
            let next = self.held_alerts().pop_front();
            let Some(text) = next else {
                break;
            };
            if let Err(e) = self.alert(&text).await {
                tracing::debug!(error = %e, "Held admin alerts still undeliverable");
                self.held_alerts().push_front(text);
                break;
            }
        }
    }

    async fn alert(&self, text: &str) -> Result<(), crate::connection::SendError> {
        let Some(chat_id) = self.messenger.resolve_recipient(&self.recipient).await? else {
            tracing::warn!(recipient = %self.recipient, "Admin recipient cannot be resolved");
            return Ok(());
        };
        self.messenger.send(&chat_id, text).await?;
        tracing::debug!(recipient = %self.recipient, "Admin alert sent");
        Ok(())
    }
}
