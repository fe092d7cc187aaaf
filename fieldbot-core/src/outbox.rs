// ABOUTME: Polls the persisted notification queue and delivers through the live chat session.
// ABOUTME: At-least-once delivery with bounded retries; exhausted rows are dead-lettered as FAILED.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::OutboxConfig;
use crate::connection::{Messenger, SendError};
use crate::metrics::Counters;
use crate::repository::{DispatchRepository, NotificationStatus, PendingNotification};

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// 0 = retry forever
    pub max_attempts: u32,
}

impl From<&OutboxConfig> for OutboxSettings {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts,
        }
    }
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self::from(&OutboxConfig::default())
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delivered: usize,
    /// Unresolvable recipients marked SENT without delivery
    pub skipped: usize,
    /// Failed this tick, still PENDING
    pub failed: usize,
    pub dead_lettered: usize,
    /// Connection went away mid-batch
    pub interrupted: bool,
}

pub struct NotificationOutbox {
    repo: Arc<dyn DispatchRepository>,
    messenger: Arc<dyn Messenger>,
    counters: Arc<Counters>,
    settings: OutboxSettings,
}

impl NotificationOutbox {
    pub fn new(
        repo: Arc<dyn DispatchRepository>,
        messenger: Arc<dyn Messenger>,
        counters: Arc<Counters>,
        settings: OutboxSettings,
    ) -> Self {
        Self {
            repo,
            messenger,
            counters,
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            batch = self.settings.batch_size,
            "Notification outbox started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if report != TickReport::default() => {
                            tracing::info!(?report, "Outbox tick");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = ?e, "Outbox tick failed");
                            crate::metrics::record_error("outbox");
                        }
                    }
                }
            }
        }
        tracing::info!("Notification outbox stopped");
    }

    /// Deliver one batch, oldest first. Does nothing unless the connection is open.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        if !self.messenger.is_open() {
            tracing::trace!("Outbox idle; connection not open");
            return Ok(report);
        }

        let batch = self
            .repo
            .list_pending_notifications(self.settings.batch_size)
            .await?;

        for notification in batch {
            let chat_id = match self.messenger.resolve_recipient(&notification.recipient).await {
                Ok(Some(chat_id)) => chat_id,
                Ok(None) => {
                    tracing::warn!(
                        id = notification.id,
                        recipient = %notification.recipient,
                        "Unresolvable recipient; marking notification sent without delivery"
                    );
                    self.repo
                        .mark_notification_sent(notification.id, Utc::now())
                        .await?;
                    report.skipped += 1;
                    continue;
                }
                Err(SendError::Unavailable) => {
                    report.interrupted = true;
                    break;
                }
                Err(SendError::Transport(e)) => {
                    self.record_failure(&notification, &e.to_string(), &mut report)
                        .await?;
                    continue;
                }
            };

            match self.messenger.send(&chat_id, &notification.message).await {
                Ok(()) => {
                    self.repo
                        .mark_notification_sent(notification.id, Utc::now())
                        .await?;
                    self.counters.record_notification(true);
                    report.delivered += 1;
                    tracing::debug!(id = notification.id, chat = %chat_id, "Notification delivered");
                }
                Err(SendError::Unavailable) => {
                    report.interrupted = true;
                    break;
                }
                Err(SendError::Transport(e)) => {
                    self.record_failure(&notification, &e.to_string(), &mut report)
                        .await?;
                }
            }
        }

        Ok(report)
    }

    async fn record_failure(
        &self,
        notification: &PendingNotification,
        error: &str,
        report: &mut TickReport,
    ) -> Result<()> {
        self.counters.record_notification(false);
        let status = self
            .repo
            .record_notification_failure(notification.id, error, self.settings.max_attempts)
            .await?;
        if status == NotificationStatus::Failed {
            tracing::error!(
                id = notification.id,
                recipient = %notification.recipient,
                attempts = notification.attempts + 1,
                error = %error,
                "Notification dead-lettered"
            );
            report.dead_lettered += 1;
        } else {
            tracing::warn!(
                id = notification.id,
                attempts = notification.attempts + 1,
                error = %error,
                "Notification delivery failed; will retry"
            );
            report.failed += 1;
        }
        Ok(())
    }
}
