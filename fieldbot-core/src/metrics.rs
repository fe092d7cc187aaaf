// ABOUTME: Counters for commands and message traffic, mirrored to Prometheus metrics
// ABOUTME: Atomic values feed status snapshots; the metrics crate feeds /metrics

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Install the Prometheus recorder and return the render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

pub fn set_connection_open(open: bool) {
    metrics::gauge!("fieldbot_connection_open").set(if open { 1.0 } else { 0.0 });
}

pub fn record_reconnect_attempt() {
    metrics::counter!("fieldbot_reconnect_attempts_total").increment(1);
}

pub fn record_error(kind: &'static str) {
    metrics::counter!("fieldbot_errors_total", "kind" => kind).increment(1);
}

/// Message counters published in status snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCounters {
    pub received: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
}

/// Process-wide counters
#[derive(Debug, Default)]
pub struct Counters {
    commands: AtomicU64,
    received: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    per_verb: Mutex<HashMap<String, u64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatched command, recognized or not
    pub fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fieldbot_commands_total").increment(1);
    }

    /// Recognized commands only
    pub fn record_verb(&self, verb: &str) {
        let mut per_verb = self
            .per_verb
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *per_verb.entry(verb.to_string()).or_insert(0) += 1;
        metrics::counter!("fieldbot_command_verbs_total", "verb" => verb.to_string()).increment(1);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fieldbot_messages_received_total").increment(1);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fieldbot_messages_sent_total").increment(1);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fieldbot_send_failures_total").increment(1);
    }

    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("fieldbot_notifications_total", "result" => "sent").increment(1);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("fieldbot_notifications_total", "result" => "failed").increment(1);
        }
    }

    pub fn command_count(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    pub fn verb_count(&self, verb: &str) -> u64 {
        self.per_verb
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(verb)
            .copied()
            .unwrap_or(0)
    }

    pub fn verb_counts(&self) -> HashMap<String, u64> {
        self.per_verb
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn messages(&self) -> MessageCounters {
        MessageCounters {
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_without_recorder() {
        // No recorder installed: metrics macros are no-ops, atomics still count
        let counters = Counters::new();
        counters.record_command();
        counters.record_command();
        counters.record_verb("claim");
        counters.record_received();
        counters.record_sent();
        counters.record_notification(false);

        assert_eq!(counters.command_count(), 2);
        assert_eq!(counters.verb_count("claim"), 1);
        assert_eq!(counters.verb_count("start"), 0);
        let messages = counters.messages();
        assert_eq!(messages.received, 1);
        assert_eq!(messages.sent, 1);
        assert_eq!(messages.notifications_failed, 1);
    }
}
