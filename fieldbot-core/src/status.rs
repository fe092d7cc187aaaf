// ABOUTME: Periodic status snapshots: written atomically to disk for other processes
// ABOUTME: and pushed to the live event hub; also renders uptime for chat replies and the CLI.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionManager, ConnectionState};
use crate::events::{ConnectionStateData, EventHub, LiveEvent};
use crate::metrics::{Counters, MessageCounters};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotUser {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Cross-process status record, rebuilt every publish tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connected: bool,
    pub user: Option<SnapshotUser>,
    pub status: String,
    pub last_update: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub command_count: u64,
    #[serde(default)]
    pub messages: MessageCounters,
}

/// Anything that can produce a status snapshot on demand
pub trait StatusSource: Send + Sync {
    fn snapshot(&self) -> StatusSnapshot;
}

/// Samples the live connection and counters
pub struct StatusSampler {
    connection: Arc<ConnectionManager>,
    counters: Arc<Counters>,
    started: Instant,
}

impl StatusSampler {
    pub fn new(connection: Arc<ConnectionManager>, counters: Arc<Counters>) -> Self {
        Self {
            connection,
            counters,
            started: Instant::now(),
        }
    }
}

impl StatusSource for StatusSampler {
    fn snapshot(&self) -> StatusSnapshot {
        let state = self.connection.state();
        let user = self.connection.identity().map(|identity| SnapshotUser {
            id: identity.id,
            name: identity.name,
            phone: identity.phone,
        });
        StatusSnapshot {
            connected: state.is_open(),
            user,
            status: state.to_string(),
            last_update: Utc::now(),
            uptime_seconds: self.started.elapsed().as_secs(),
            command_count: self.counters.command_count(),
            messages: self.counters.messages(),
        }
    }
}

/// Write the snapshot as JSON via a temp file and rename
pub async fn write_snapshot(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create status directory")?;
    }
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Read the last snapshot written by a running gateway
pub fn read_snapshot(path: &Path) -> Result<Option<StatusSnapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("Malformed status snapshot at {}", path.display()))?;
    Ok(Some(snapshot))
}

/// "1d 2h 3m 4s", dropping leading zero units
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

pub struct StatusPublisher {
    source: Arc<dyn StatusSource>,
    events: EventHub,
    path: PathBuf,
    interval: Duration,
    latest: watch::Sender<Option<StatusSnapshot>>,
}

impl StatusPublisher {
    pub fn new(
        source: Arc<dyn StatusSource>,
        events: EventHub,
        path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            source,
            events,
            path: path.into(),
            interval: interval.max(Duration::from_secs(1)),
            latest,
        }
    }

    /// Most recent published snapshot
    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest.borrow().clone()
    }

    pub fn watch_latest(&self) -> watch::Receiver<Option<StatusSnapshot>> {
        self.latest.subscribe()
    }

    pub async fn publish_once(&self) -> Result<StatusSnapshot> {
        let snapshot = self.source.snapshot();
        write_snapshot(&self.path, &snapshot).await?;
        self.latest.send_replace(Some(snapshot.clone()));
        self.events.publish(LiveEvent::StatusSnapshot {
            data: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Publish on every tick and immediately on connection state changes
    pub async fn run(
        self: Arc<Self>,
        mut states: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    let detail = match &state {
                        ConnectionState::Failed { reason } => Some(reason.clone()),
                        _ => None,
                    };
                    self.events.publish(LiveEvent::ConnectionState {
                        data: ConnectionStateData {
                            state: state.as_str().to_string(),
                            detail,
                            at: Utc::now(),
                        },
                    });
                }
            }

            if let Err(e) = self.publish_once().await {
                tracing::warn!(error = %e, path = %self.path.display(), "Status publish failed");
            }
        }

        // Final snapshot so readers see the shutdown
        if let Err(e) = self.publish_once().await {
            tracing::debug!(error = %e, "Final status publish failed");
        }
        tracing::info!("Status publisher stopped");
    }
}
