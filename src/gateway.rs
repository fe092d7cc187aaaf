// ABOUTME: Wires the gateway components together from configuration and owns their tasks
// ABOUTME: Connection manager, router, outbox, status publisher and admin alerter share one cancel token

use anyhow::{Context, Result};
use fieldbot_core::alerter::AdminAlerter;
use fieldbot_core::commands::CommandRegistry;
use fieldbot_core::config::Config;
use fieldbot_core::connection::{ConnectionManager, ConnectionSettings};
use fieldbot_core::events::EventHub;
use fieldbot_core::metrics::Counters;
use fieldbot_core::outbox::{NotificationOutbox, OutboxSettings};
use fieldbot_core::router::CommandRouter;
use fieldbot_core::session::{CredentialCipher, LoadOutcome, SessionStore};
use fieldbot_core::status::{StatusPublisher, StatusSampler};
use fieldbot_core::store::SqliteRepository;
use fieldbot_core::traits::ChatTransport;
use fieldbot_core::workflow::{register_handlers, JobWorkflowService};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::AppState;

/// Open the encrypted credential store named in the config and decrypt it into memory
pub fn open_session_store(config: &Config) -> Result<Arc<SessionStore>> {
    let passphrase = config
        .credentials
        .passphrase
        .as_deref()
        .context("credentials.passphrase is required")?;
    let cipher = CredentialCipher::from_passphrase(passphrase)
        .context("Failed to derive credential key")?;
    let sessions = Arc::new(SessionStore::new(&config.credentials.path, cipher));

    match sessions.load().context("Failed to read stored credential")? {
        LoadOutcome::Loaded => tracing::info!("Using stored chat credential"),
        LoadOutcome::Missing => tracing::info!("No stored chat credential; will provision"),
        LoadOutcome::Corrupt => {
            tracing::warn!("Stored chat credential was corrupt and has been wiped")
        }
    }
    Ok(sessions)
}

/// A running gateway
pub struct Gateway {
    pub connection: Arc<ConnectionManager>,
    pub sessions: Arc<SessionStore>,
    pub repo: SqliteRepository,
    pub events: EventHub,
    pub publisher: Arc<StatusPublisher>,
    pub counters: Arc<Counters>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Build every component and spawn the background tasks. Connecting starts immediately.
    pub fn start(
        config: &Config,
        transport: Arc<dyn ChatTransport>,
        repo: SqliteRepository,
        sessions: Arc<SessionStore>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::new());
        let events = EventHub::new();

        let (connection, inbound) = ConnectionManager::new(
            transport,
            Arc::clone(&sessions),
            ConnectionSettings::from(&config.connection),
            Arc::clone(&counters),
        );
        let connection = Arc::new(connection);

        let workflow = Arc::new(JobWorkflowService::new(
            Arc::new(repo.clone()),
            events.clone(),
            &config.commands,
        ));
        let mut registry = CommandRegistry::new();
        register_handlers(&mut registry, workflow);
        tracing::info!(commands = registry.len(), "Command handlers registered");

        let sampler = Arc::new(StatusSampler::new(
            Arc::clone(&connection),
            Arc::clone(&counters),
        ));
        let router = Arc::new(CommandRouter::new(
            registry,
            connection.clone(),
            sampler.clone(),
            Arc::clone(&counters),
            &config.commands,
            connection.platform_id(),
        ));
        let outbox = Arc::new(NotificationOutbox::new(
            Arc::new(repo.clone()),
            connection.clone(),
            Arc::clone(&counters),
            OutboxSettings::from(&config.outbox),
        ));
        let publisher = Arc::new(StatusPublisher::new(
            sampler,
            events.clone(),
            &config.status.snapshot_path,
            Duration::from_secs(config.status.interval_secs),
        ));
        let alerter = Arc::new(AdminAlerter::new(
            connection.clone(),
            config.admin.recipient.clone(),
        ));

        let mut tasks = Vec::new();
        // Subscribe before the run loop starts so the first Connected event is seen
        tasks.push(tokio::spawn(
            alerter.run(connection.subscribe(), cancel.child_token()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&publisher).run(connection.watch_state(), cancel.child_token()),
        ));
        tasks.push(tokio::spawn(outbox.run(cancel.child_token())));
        let router_cancel = cancel.child_token();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = router_cancel.cancelled() => {}
                _ = router.run(inbound) => {}
            }
        }));
        tasks.push(tokio::spawn(Arc::clone(&connection).run()));

        connection.connect();

        Self {
            connection,
            sessions,
            repo,
            events,
            publisher,
            counters,
            cancel,
            tasks,
        }
    }

    pub fn app_state(&self, api_key: Option<String>, metrics: Option<PrometheusHandle>) -> AppState {
        AppState {
            repo: Arc::new(self.repo.clone()),
            status: self.publisher.watch_latest(),
            events: self.events.clone(),
            api_key,
            metrics,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every task, close the session and re-encrypt the credential to disk
    pub async fn shutdown(self) {
        tracing::info!("Shutting down gateway");
        self.cancel.cancel();
        self.connection.disconnect().await;

        for task in self.tasks {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Gateway task ended abnormally"),
                Err(_) => tracing::warn!("Gateway task did not stop in time"),
            }
        }

        if let Err(e) = self.sessions.persist() {
            tracing::error!(error = %e, "Failed to persist chat credential on shutdown");
        }
        tracing::info!("Gateway stopped");
    }
}
