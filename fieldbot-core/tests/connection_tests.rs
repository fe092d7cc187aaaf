// ABOUTME: Integration tests for the connection run loop against a scripted transport
// ABOUTME: Paused tokio clock: backoff delays, heartbeat failure, logout and re-provisioning

mod common;

use common::{session_store, MockTransport, Script, BOT_ID};
use fieldbot_core::alerter::AdminAlerter;
use fieldbot_core::connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, LifecycleEvent, Messenger, SendError,
};
use fieldbot_core::metrics::Counters;
use fieldbot_core::session::{Credential, SessionStore};
use fieldbot_core::traits::{DisconnectReason, InboundMessage, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

struct Harness {
    manager: Arc<ConnectionManager>,
    transport: Arc<MockTransport>,
    sessions: Arc<SessionStore>,
    events: broadcast::Receiver<LifecycleEvent>,
    inbound: mpsc::Receiver<InboundMessage>,
    _dir: TempDir,
}

fn start(script: Vec<Script>) -> Harness {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new(script);
    let sessions = session_store(dir.path());
    let (manager, inbound) = ConnectionManager::new(
        transport.clone(),
        sessions.clone(),
        ConnectionSettings::default(),
        Arc::new(Counters::new()),
    );
    let manager = Arc::new(manager);
    let events = manager.subscribe();
    tokio::spawn(Arc::clone(&manager).run());
    Harness {
        manager,
        transport,
        sessions,
        events,
        inbound,
        _dir: dir,
    }
}

async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(3600), events.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle channel closed")
}

fn network(reason: &str) -> Script {
    Script::Fail(TransportError::Network(reason.into()))
}

#[tokio::test(start_paused = true)]
async fn test_connect_opens_session_and_stores_credential() {
    let mut h = start(vec![Script::Open]);
    assert_eq!(h.manager.state(), ConnectionState::Idle);
    assert_eq!(h.manager.connect(), ConnectionState::Connecting);

    match next_event(&mut h.events).await {
        LifecycleEvent::Connected { identity } => assert_eq!(identity.id, BOT_ID),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.manager.state(), ConnectionState::Open);
    assert!(h.manager.is_open());
    assert_eq!(h.manager.identity().unwrap().id, BOT_ID);
    assert_eq!(h.sessions.current(), Some(Credential::new(b"token-1".to_vec())));
    assert!(h.sessions.path().exists());
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let mut h = start(vec![Script::Open, Script::Open]);
    h.manager.connect();
    h.manager.connect();
    h.manager.connect();
    next_event(&mut h.events).await;

    assert_eq!(h.manager.connect(), ConnectionState::Open);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_fatal() {
    let mut h = start((0..6).map(|i| network(&format!("down {}", i))).collect());
    let started = tokio::time::Instant::now();
    h.manager.connect();

    let mut delays = Vec::new();
    loop {
        match next_event(&mut h.events).await {
            LifecycleEvent::ReconnectScheduled { attempt, delay } => {
                assert_eq!(attempt as usize, delays.len() + 1);
                delays.push(delay.as_secs());
            }
            LifecycleEvent::Fatal { reason } => {
                assert!(reason.contains("down 5"), "reason: {}", reason);
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(h.transport.open_count(), 6);
    assert!(matches!(h.manager.state(), ConnectionState::Failed { .. }));
    assert!(started.elapsed() >= Duration::from_secs(62));

    // No further attempts without an operator
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.transport.open_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_fatal_resets_backoff() {
    let mut h = start(vec![Script::Fail(TransportError::Auth("forbidden".into()))]);
    h.manager.connect();
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::Fatal { .. }
    ));

    h.transport.push_script(Script::Open);
    assert_eq!(h.manager.connect(), ConnectionState::Connecting);
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::Connected { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_network_drop_reconnects_with_stored_credential() {
    let mut h = start(vec![Script::Open, Script::Open]);
    h.manager.connect();
    next_event(&mut h.events).await;

    h.transport
        .drop_session(DisconnectReason::Network("connection reset".into()))
        .await;

    assert_eq!(
        next_event(&mut h.events).await,
        LifecycleEvent::Disconnected {
            reason: DisconnectReason::Network("connection reset".into())
        }
    );
    assert_eq!(
        next_event(&mut h.events).await,
        LifecycleEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(2)
        }
    );
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::Connected { .. }
    ));

    let opens = h.transport.opens();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[1], Some(Credential::new(b"token-1".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn test_logout_wipes_credential_and_reprovisions() {
    let mut h = start(vec![Script::Open, Script::NeedsProvisioning]);
    h.manager.connect();
    next_event(&mut h.events).await;
    assert!(h.sessions.path().exists());

    h.transport.drop_session(DisconnectReason::LoggedOut).await;
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::Disconnected {
            reason: DisconnectReason::LoggedOut
        }
    ));
    assert_eq!(next_event(&mut h.events).await, LifecycleEvent::LoggedOut);
    assert_eq!(h.manager.state(), ConnectionState::LoggedOut);
    assert!(h.sessions.current().is_none());
    assert!(!h.sessions.path().exists());

    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::ProvisioningRequired { .. }
    ));
    assert_eq!(h.manager.state(), ConnectionState::AwaitingProvisioning);
    // Re-provisioning starts without a credential
    assert_eq!(h.transport.opens()[1], None);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_credential_treated_as_logout() {
    let mut h = start(vec![
        Script::Fail(TransportError::CorruptCredential("bad json".into())),
        Script::Open,
    ]);
    h.sessions
        .store(Credential::new(b"garbage".to_vec()))
        .unwrap();
    h.manager.connect();

    assert_eq!(next_event(&mut h.events).await, LifecycleEvent::LoggedOut);
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::Connected { .. }
    ));
    assert_eq!(h.transport.opens()[1], None);
    assert_eq!(h.sessions.current(), Some(Credential::new(b"token-2".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failures_drop_connection() {
    let mut h = start(vec![Script::Open, Script::Open]);
    h.manager.connect();
    next_event(&mut h.events).await;

    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(h.transport.keep_alives(), 2);
    assert!(h.manager.is_open());

    h.transport.fail_keep_alive(true);
    match next_event(&mut h.events).await {
        LifecycleEvent::Disconnected {
            reason: DisconnectReason::Network(reason),
        } => assert!(reason.contains("keep-alive")),
        other => panic!("unexpected {:?}", other),
    }
    h.transport.fail_keep_alive(false);
    assert!(matches!(
        next_event(&mut h.events).await,
        LifecycleEvent::ReconnectScheduled { attempt: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_connection() {
    let mut h = start(vec![Script::Open]);
    assert_eq!(
        h.manager.send("dm:1", "hello").await,
        Err(SendError::Unavailable)
    );
    assert_eq!(
        h.manager.resolve_recipient("6281111").await,
        Err(SendError::Unavailable)
    );

    h.manager.connect();
    next_event(&mut h.events).await;
    h.manager.send("dm:1", "hello").await.unwrap();
    assert_eq!(
        h.transport.sent(),
        vec![("dm:1".to_string(), "hello".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_are_forwarded() {
    let mut h = start(vec![Script::Open]);
    h.manager.connect();
    next_event(&mut h.events).await;

    h.transport
        .deliver(common::text_from("6281111", "!ping"))
        .await;
    let message = h.inbound.recv().await.unwrap();
    assert_eq!(message.sender.phone.as_deref(), Some("6281111"));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_run_loop() {
    let mut h = start(vec![Script::Open]);
    h.manager.connect();
    next_event(&mut h.events).await;

    h.manager.disconnect().await;
    assert_eq!(h.manager.state(), ConnectionState::Idle);
    assert!(h.manager.identity().is_none());
    assert!(h.transport.closes() >= 1);

    // Cancelled loop never opens again
    h.manager.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.transport.open_count(), 1);
}

async fn wait_for_sent(transport: &MockTransport, n: usize) -> Vec<String> {
    for _ in 0..3000 {
        let sent = transport.sent();
        if sent.len() >= n {
            return sent.into_iter().map(|(_, text)| text).collect();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} sent messages, got {:?}", n, transport.sent());
}

#[tokio::test(start_paused = true)]
async fn test_outage_alerts_reach_admin_after_reconnect() {
    let h = start(vec![Script::Open, network("refused"), Script::Open]);
    let alerter = Arc::new(AdminAlerter::new(h.manager.clone(), "6280000"));
    let cancel = CancellationToken::new();
    tokio::spawn(alerter.clone().run(h.manager.subscribe(), cancel.clone()));

    h.manager.connect();
    wait_for_sent(&h.transport, 1).await;

    h.transport
        .drop_session(DisconnectReason::Network("connection reset".into()))
        .await;

    let texts = wait_for_sent(&h.transport, 5).await;
    assert_eq!(
        texts,
        vec![
            format!("✅ fieldbot connected as {}", BOT_ID),
            "⚠️ fieldbot disconnected: network: connection reset".to_string(),
            "🔄 fieldbot reconnecting (attempt 1) in 2s".to_string(),
            "🔄 fieldbot reconnecting (attempt 2) in 4s".to_string(),
            format!("✅ fieldbot connected as {}", BOT_ID),
        ]
    );
    assert!(h
        .transport
        .sent()
        .iter()
        .all(|(chat_id, _)| chat_id == "dm:6280000"));
    assert_eq!(alerter.held_count(), 0);
    cancel.cancel();
}
