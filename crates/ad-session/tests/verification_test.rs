use std::sync::Arc;
use std::time::{Duration, Instant};

use ad_core::clock::ManualClock;
use ad_core::config::VerificationConfig;
use ad_core::event_bus::{Event, EventBus};
use ad_core::isolation::PathGuardError;
use ad_core::types::TenantId;
use ad_session::verification::{RelayError, VerificationRelay};

fn tenant(raw: &str) -> TenantId {
    TenantId::parse(raw).unwrap()
}

fn relay(clock: ManualClock) -> (Arc<VerificationRelay>, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let config = VerificationConfig {
        artifact_dir: tmp.path().to_path_buf(),
        ..VerificationConfig::default()
    };
    let relay = VerificationRelay::with_clock(&config, EventBus::new(), Arc::new(clock));
    (Arc::new(relay), tmp)
}

// ===========================================================================
// Publish / answer / await
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_lookup_answer_await() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let t = tenant("tenant-a");

    let request_id = relay
        .publish(&t, "task-1", "HR Manager @ Acme", "/tmp/shot1.png")
        .unwrap();

    let found = relay.lookup(&request_id).unwrap();
    assert_eq!(found.tenant_id, t);
    assert_eq!(found.task_id, "task-1");
    assert_eq!(found.challenge_label, "HR Manager @ Acme");
    assert!(!found.answered);

    let waiter = {
        let relay = Arc::clone(&relay);
        let t = t.clone();
        tokio::spawn(async move {
            relay
                .await_answer(&t, "task-1", Duration::from_secs(30))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.answer(&request_id, "883211").unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), "883211");

    // Consumed by the waiter.
    assert!(matches!(
        relay.lookup(&request_id),
        Err(RelayError::NotFound(_))
    ));
    assert_eq!(relay.pending_count(), 0);
}

#[tokio::test]
async fn test_answer_before_wait_is_delivered() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let t = tenant("tenant-a");
    let id = relay.publish(&t, "task-1", "label", "/tmp/a.png").unwrap();
    relay.answer(&id, "42").unwrap();

    let answer = relay
        .await_answer(&t, "task-1", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(answer, "42");
}

#[tokio::test]
async fn test_second_answer_is_rejected() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let id = relay
        .publish(&tenant("tenant-a"), "task-1", "label", "/tmp/a.png")
        .unwrap();

    assert!(relay.answer(&id, "first").is_ok());
    assert!(matches!(
        relay.answer(&id, "second"),
        Err(RelayError::AlreadyAnswered(_))
    ));
    assert_eq!(relay.lookup(&id).unwrap().answer.as_deref(), Some("first"));
}

#[tokio::test]
async fn test_await_times_out_and_request_survives() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let t = tenant("tenant-a");
    let id = relay.publish(&t, "task-1", "label", "/tmp/a.png").unwrap();

    let started = Instant::now();
    let err = relay
        .await_answer(&t, "task-1", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(2));

    // A slow human can still answer after the waiter gave up.
    assert!(relay.lookup(&id).is_ok());
    assert!(relay.answer(&id, "late").is_ok());
}

#[tokio::test]
async fn test_await_unknown_task_is_not_found() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let err = relay
        .await_answer(&tenant("tenant-a"), "nope", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
}

#[tokio::test]
async fn test_unknown_request_id_is_not_found() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    assert!(matches!(
        relay.answer("no-such-id", "1"),
        Err(RelayError::NotFound(_))
    ));
}

// ===========================================================================
// Expiry
// ===========================================================================

#[tokio::test]
async fn test_request_expires_after_five_minutes() {
    let clock = ManualClock::starting_now();
    let (relay, _tmp) = relay(clock.clone());
    let t = tenant("tenant-a");
    let id = relay.publish(&t, "task-1", "label", "/tmp/a.png").unwrap();

    clock.advance(Duration::from_secs(299));
    assert!(relay.lookup(&id).is_ok());
    assert!(relay.lookup_by_tenant_and_task(&t, "task-1").is_ok());

    clock.advance(Duration::from_secs(2));
    assert!(matches!(relay.lookup(&id), Err(RelayError::Expired(_))));
    assert!(matches!(
        relay.lookup_by_tenant_and_task(&t, "task-1"),
        Err(RelayError::Expired(_))
    ));
    assert!(matches!(relay.answer(&id, "1"), Err(RelayError::Expired(_))));
}

#[tokio::test]
async fn test_sweep_removes_expired_and_keeps_expired_status() {
    let clock = ManualClock::starting_now();
    let (relay, tmp) = relay(clock.clone());
    let t = tenant("tenant-a");

    let artifact = relay.challenge_artifact_path(&t, "task-1").unwrap();
    assert!(artifact.starts_with(tmp.path()));
    std::fs::write(&artifact, b"png").unwrap();
    let id = relay.publish(&t, "task-1", "label", &artifact).unwrap();
    let fresh = relay.publish(&t, "task-2", "label", "/tmp/b.png").unwrap();

    clock.advance(Duration::from_secs(200));
    let _newer = relay.publish(&t, "task-3", "label", "/tmp/c.png").unwrap();
    clock.advance(Duration::from_secs(101));

    assert_eq!(relay.sweep_expired(), 2);
    assert_eq!(relay.pending_count(), 1);
    assert!(!artifact.exists());
    assert!(matches!(relay.lookup(&id), Err(RelayError::Expired(_))));
    assert!(matches!(relay.answer(&fresh, "1"), Err(RelayError::Expired(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_releases_waiter_as_expired() {
    let clock = ManualClock::starting_now();
    let (relay, _tmp) = relay(clock.clone());
    let t = tenant("tenant-a");
    relay.publish(&t, "task-1", "label", "/tmp/a.png").unwrap();

    let waiter = {
        let relay = Arc::clone(&relay);
        let t = t.clone();
        tokio::spawn(async move {
            relay
                .await_answer(&t, "task-1", Duration::from_secs(10))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    clock.advance(Duration::from_secs(301));
    relay.sweep_expired();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter must not hang")
        .unwrap();
    assert!(matches!(result, Err(RelayError::Expired(_))));
}

#[tokio::test]
async fn test_concurrent_sweep_and_answer() {
    let clock = ManualClock::starting_now();
    let (relay, _tmp) = relay(clock.clone());
    let t = tenant("tenant-a");
    let ids: Vec<String> = (0..50)
        .map(|i| {
            relay
                .publish(&t, &format!("task-{i}"), "label", "/tmp/x.png")
                .unwrap()
        })
        .collect();

    let sweeper = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            for _ in 0..20 {
                relay.sweep_expired();
                tokio::task::yield_now().await;
            }
        })
    };
    for id in &ids {
        relay.answer(id, "ok").unwrap();
    }
    sweeper.await.unwrap();
    assert_eq!(relay.pending_count(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_accepts_unbounded_timeout() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let t = tenant("tenant-a");
    let id = relay.publish(&t, "task-1", "label", "/tmp/a.png").unwrap();

    let waiter = {
        let relay = Arc::clone(&relay);
        let t = t.clone();
        tokio::spawn(async move {
            relay
                .await_answer(&t, "task-1", Duration::from_secs(u64::MAX))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    relay.answer(&id, "4711").unwrap();

    let answer = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter released by the answer")
        .unwrap()
        .unwrap();
    assert_eq!(answer, "4711");
}

// ===========================================================================
// Artifact ownership
// ===========================================================================

#[tokio::test]
async fn test_publish_refuses_another_tenants_artifact() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let b_shot = relay
        .challenge_artifact_path(&tenant("tenant-b"), "task-1")
        .unwrap();
    std::fs::write(&b_shot, b"tenant-b screenshot").unwrap();

    let result = relay.publish(&tenant("tenant-a"), "task-9", "x", &b_shot);
    assert!(matches!(
        result,
        Err(RelayError::Artifact(PathGuardError::Outside(_)))
    ));
    assert_eq!(relay.pending_count(), 0);
    assert!(b_shot.exists());
}

#[tokio::test]
async fn test_foreign_artifact_is_never_served_or_deleted() {
    let clock = ManualClock::starting_now();
    let (relay, tmp) = relay(clock.clone());
    let b_shot = relay
        .challenge_artifact_path(&tenant("tenant-b"), "task-1")
        .unwrap();
    std::fs::write(&b_shot, b"tenant-b screenshot").unwrap();

    // Unresolvable when published, so only the read-side guard can catch it.
    let file_name = b_shot.file_name().unwrap();
    let sneaky = tmp
        .path()
        .join("tenant-a")
        .join("not-yet")
        .join("..")
        .join("..")
        .join("tenant-b")
        .join(file_name);
    let id = relay
        .publish(&tenant("tenant-a"), "task-9", "x", &sneaky)
        .unwrap();
    assert!(relay.resolve_artifact(&id).is_err());

    clock.advance(Duration::from_secs(301));
    assert_eq!(relay.sweep_expired(), 1);
    assert!(b_shot.exists());
}

#[tokio::test]
async fn test_own_artifact_resolves() {
    let (relay, _tmp) = relay(ManualClock::starting_now());
    let t = tenant("tenant-a");
    let shot = relay.challenge_artifact_path(&t, "task-1").unwrap();
    std::fs::write(&shot, b"png").unwrap();
    let id = relay.publish(&t, "task-1", "x", &shot).unwrap();
    assert_eq!(
        relay.resolve_artifact(&id).unwrap(),
        shot.canonicalize().unwrap()
    );
}

// ===========================================================================
// Events
// ===========================================================================

#[tokio::test]
async fn test_publish_and_answer_emit_events() {
    let tmp = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let config = VerificationConfig {
        artifact_dir: tmp.path().to_path_buf(),
        ..VerificationConfig::default()
    };
    let relay = VerificationRelay::new(&config, bus);

    let id = relay
        .publish(&tenant("tenant-a"), "task-1", "label", "/tmp/a.png")
        .unwrap();
    relay.answer(&id, "1").unwrap();

    assert!(matches!(
        rx.try_recv(),
        Ok(Event::ChallengePublished { request_id, .. }) if request_id == id
    ));
    assert!(matches!(
        rx.try_recv(),
        Ok(Event::ChallengeAnswered { .. })
    ));
}
