use std::sync::Arc;
use std::time::{Duration, Instant};

use ad_core::event_bus::{Event, EventBus};
use ad_core::types::TenantId;
use ad_session::protocol::{AgentMessage, ServerCommand};
use ad_session::remote_hub::{LoginOutcome, RemoteSessionHub, RemoteState};

fn tenant(raw: &str) -> TenantId {
    TenantId::parse(raw).unwrap()
}

fn hub() -> Arc<RemoteSessionHub> {
    Arc::new(RemoteSessionHub::new(
        Duration::from_secs(300),
        EventBus::new(),
    ))
}

/// Wait until the agent side receives a `login` command.
async fn expect_login(rx: &flume::Receiver<ServerCommand>) {
    let cmd = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
        .await
        .expect("login command not sent")
        .unwrap();
    assert!(matches!(cmd, ServerCommand::Login { .. }));
}

#[tokio::test]
async fn test_offline_login_returns_immediately() {
    let hub = hub();
    let started = Instant::now();
    let outcome = hub
        .request_login(&tenant("tenant-b"), Duration::from_secs(2))
        .await;
    assert_eq!(outcome, LoginOutcome::Offline);
    assert!(!outcome.is_success());
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_complete_releases_caller() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let caller = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(5)).await })
    };
    expect_login(&rx).await;
    assert_eq!(hub.state(&t), RemoteState::AwaitingLogin);

    hub.on_message(&t, AgentMessage::LoginComplete);
    assert_eq!(caller.await.unwrap(), LoginOutcome::Succeeded);
    assert_eq!(hub.state(&t), RemoteState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_failed_carries_reason() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let caller = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(5)).await })
    };
    expect_login(&rx).await;
    hub.on_message(
        &t,
        AgentMessage::LoginFailed {
            reason: Some("wrong password".into()),
        },
    );
    assert_eq!(
        caller.await.unwrap(),
        LoginOutcome::Failed("wrong password".into())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_releases_pending_login() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    let conn = hub.on_connect(&t, tx);

    let started = Instant::now();
    let caller = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(30)).await })
    };
    expect_login(&rx).await;
    assert!(hub.on_disconnect(&t, conn));

    let outcome = tokio::time::timeout(Duration::from_secs(2), caller)
        .await
        .expect("caller must not hang")
        .unwrap();
    assert_eq!(outcome, LoginOutcome::Disconnected);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(hub.state(&t), RemoteState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_supersedes_pending_login() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx1, rx1) = flume::unbounded();
    hub.on_connect(&t, tx1);

    let caller = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(30)).await })
    };
    expect_login(&rx1).await;

    let (tx2, _rx2) = flume::unbounded();
    hub.on_connect(&t, tx2);
    assert_eq!(caller.await.unwrap(), LoginOutcome::Superseded);
    assert_eq!(hub.state(&t), RemoteState::Connected);
}

#[tokio::test]
async fn test_login_timeout_returns_to_connected() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, _rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let outcome = hub.request_login(&t, Duration::from_millis(100)).await;
    assert_eq!(outcome, LoginOutcome::TimedOut);
    assert_eq!(hub.state(&t), RemoteState::Connected);

    // A late login_complete has nothing to release and changes nothing.
    hub.on_message(&t, AgentMessage::LoginComplete);
    assert_eq!(hub.state(&t), RemoteState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_login() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let callers: Vec<_> = (0..3)
        .map(|_| {
            let hub = Arc::clone(&hub);
            let t = t.clone();
            tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(5)).await })
        })
        .collect();
    expect_login(&rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.on_message(&t, AgentMessage::LoginComplete);

    for caller in callers {
        assert_eq!(caller.await.unwrap(), LoginOutcome::Succeeded);
    }
    // Only one login command went out.
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_login_is_cancelled() {
    let hub = hub();
    let t = tenant("tenant-c");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let caller = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(30)).await })
    };
    expect_login(&rx).await;
    assert_eq!(hub.state(&t), RemoteState::AwaitingLogin);

    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    assert_eq!(hub.state(&t), RemoteState::Connected);

    // The next login sends its own command instead of joining a dead one.
    let retry = {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(5)).await })
    };
    expect_login(&rx).await;
    hub.on_message(&t, AgentMessage::LoginComplete);
    assert_eq!(retry.await.unwrap(), LoginOutcome::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_caller_leaving_keeps_shared_login() {
    let hub = hub();
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    let spawn_caller = || {
        let hub = Arc::clone(&hub);
        let t = t.clone();
        tokio::spawn(async move { hub.request_login(&t, Duration::from_secs(5)).await })
    };
    let leaver = spawn_caller();
    expect_login(&rx).await;
    let stayer = spawn_caller();
    tokio::time::sleep(Duration::from_millis(50)).await;

    leaver.abort();
    let _ = leaver.await;
    assert_eq!(hub.state(&t), RemoteState::AwaitingLogin);

    hub.on_message(&t, AgentMessage::LoginComplete);
    assert_eq!(stayer.await.unwrap(), LoginOutcome::Succeeded);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_replaced_session_reports_disconnect() {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let hub = RemoteSessionHub::new(Duration::from_secs(300), bus);
    let t = tenant("tenant-a");
    let (tx1, _rx1) = flume::unbounded();
    let (tx2, _rx2) = flume::unbounded();
    hub.on_connect(&t, tx1);
    hub.on_connect(&t, tx2);

    let seen: Vec<Event> = events.drain().collect();
    assert!(matches!(seen[0], Event::AgentConnected { .. }));
    assert!(matches!(seen[1], Event::AgentDisconnected { .. }));
    assert!(matches!(seen[2], Event::AgentConnected { .. }));
    assert_eq!(seen.len(), 3);
    assert!(hub.is_online(&t));
}

#[tokio::test]
async fn test_delivery_flow_and_events() {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let hub = RemoteSessionHub::new(Duration::from_secs(300), bus);
    let t = tenant("tenant-a");
    let (tx, rx) = flume::unbounded();
    hub.on_connect(&t, tx);

    hub.send_delivery_command(&t, serde_json::json!({"keywords": ["rust"]}))
        .unwrap();
    assert!(matches!(
        rx.try_recv().unwrap(),
        ServerCommand::StartDelivery { .. }
    ));

    hub.on_message(
        &t,
        AgentMessage::DeliveryProgress {
            progress: serde_json::json!({"sent": 1}),
        },
    );
    hub.on_message(
        &t,
        AgentMessage::Unknown {
            action: "heartbeat".into(),
        },
    );
    hub.on_message(
        &t,
        AgentMessage::DeliveryComplete {
            summary: serde_json::json!({"sent": 1}),
        },
    );
    assert_eq!(rx.try_recv().unwrap(), ServerCommand::DeliveryAck);

    let seen: Vec<Event> = events.drain().collect();
    assert!(matches!(seen[0], Event::AgentConnected { .. }));
    assert!(matches!(seen[1], Event::DeliveryProgress { .. }));
    assert!(matches!(seen[2], Event::DeliveryComplete { .. }));
    assert_eq!(seen.len(), 3);
}
