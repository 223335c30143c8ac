use std::sync::Arc;

use ad_bridge::http_api::{api_router, ApiState};
use ad_core::config::Config;
use ad_core::event_bus::EventBus;
use ad_telemetry::metrics::MetricsCollector;
use serde_json::{json, Value};
use tempfile::TempDir;

async fn start_test_server() -> (String, Arc<ApiState>, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.worker.log_dir = tmp.path().join("logs");
    config.worker.session_root = tmp.path().join("sessions");
    config.verification.artifact_dir = tmp.path().join("artifacts");
    config.verification.max_wait_secs = 10;
    let state = Arc::new(ApiState::new(
        &config,
        EventBus::new(),
        Arc::new(MetricsCollector::with_defaults()),
    ));
    let router = api_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), state, tmp)
}

async fn publish(client: &reqwest::Client, base: &str, body: Value) -> Value {
    let resp = client
        .post(format!("{base}/api/verification"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_publish_poll_answer_and_await() {
    let (base, _state, _tmp) = start_test_server().await;
    let client = reqwest::Client::new();

    let published = publish(
        &client,
        &base,
        json!({
            "tenant_id": "tenant-a",
            "task_id": "task-1",
            "challenge_label": "HR Manager @ Acme",
            "artifact_path": "/tmp/shot1.png",
        }),
    )
    .await;
    let request_id = published["request_id"].as_str().unwrap().to_string();

    let view: Value = reqwest::get(format!("{base}/api/verification/{request_id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["tenant_id"], "tenant-a");
    assert_eq!(view["task_id"], "task-1");
    assert_eq!(view["challenge_label"], "HR Manager @ Acme");
    assert_eq!(
        view["artifact_url"],
        format!("/api/verification/{request_id}/artifact")
    );
    assert!(view.get("artifact_path").is_none());

    let waiter = {
        let client = client.clone();
        let base = base.clone();
        tokio::spawn(async move {
            client
                .post(format!("{base}/api/verification/await"))
                .json(&json!({"tenant_id": "tenant-a", "task_id": "task-1", "timeout_secs": 30}))
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let resp = client
        .post(format!("{base}/api/verification/answer"))
        .json(&json!({"request_id": request_id, "answer": "883211"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["accepted"], true);

    let resp = waiter.await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap()["answer"], "883211");
}

#[tokio::test]
async fn test_answer_rejections_are_distinct() {
    let (base, state, _tmp) = start_test_server().await;
    let client = reqwest::Client::new();
    let published = publish(
        &client,
        &base,
        json!({"tenant_id": "tenant-a", "task_id": "task-1", "challenge_label": "Acme"}),
    )
    .await;
    let request_id = published["request_id"].as_str().unwrap();

    let answer = |id: String| {
        let client = client.clone();
        let base = base.clone();
        async move {
            client
                .post(format!("{base}/api/verification/answer"))
                .json(&json!({"request_id": id, "answer": "1234"}))
                .send()
                .await
                .unwrap()
        }
    };

    assert_eq!(answer(request_id.to_string()).await.status(), 200);

    let resp = answer(request_id.to_string()).await;
    assert_eq!(resp.status(), 409);
    assert_eq!(resp.json::<Value>().await.unwrap()["rejected"], "already_answered");

    let resp = answer("tenant-a-task-9-0-deadbeef".to_string()).await;
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.json::<Value>().await.unwrap()["rejected"], "not_found");

    assert_eq!(
        state
            .metrics
            .counter("verification_answered_total", &[("result", "already_answered")]),
        1
    );
}

#[tokio::test]
async fn test_lookup_by_tenant_and_task() {
    let (base, _state, _tmp) = start_test_server().await;
    let client = reqwest::Client::new();
    for task in ["task-1", "task-2"] {
        publish(
            &client,
            &base,
            json!({"tenant_id": "tenant-a", "task_id": task, "challenge_label": task}),
        )
        .await;
    }
    publish(
        &client,
        &base,
        json!({"tenant_id": "tenant-b", "task_id": "task-1", "challenge_label": "other"}),
    )
    .await;

    let one: Value = reqwest::get(format!(
        "{base}/api/verification?tenant_id=tenant-a&task_id=task-2"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(one["challenge_label"], "task-2");

    let all: Vec<Value> = reqwest::get(format!("{base}/api/verification?tenant_id=tenant-a"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|v| v["tenant_id"] == "tenant-a"));

    let resp = reqwest::get(format!(
        "{base}/api/verification?tenant_id=tenant-a&task_id=task-9"
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_await_times_out_and_request_survives() {
    let (base, _state, _tmp) = start_test_server().await;
    let client = reqwest::Client::new();
    let published = publish(
        &client,
        &base,
        json!({"tenant_id": "tenant-a", "task_id": "task-1", "challenge_label": "Acme"}),
    )
    .await;

    let resp = client
        .post(format!("{base}/api/verification/await"))
        .json(&json!({"tenant_id": "tenant-a", "task_id": "task-1", "timeout_secs": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 408);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "timeout");

    let resp = client
        .post(format!("{base}/api/verification/answer"))
        .json(&json!({"request_id": published["request_id"], "answer": "42"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_artifact_served_only_from_artifact_dir() {
    let (base, _state, tmp) = start_test_server().await;
    let client = reqwest::Client::new();

    // Relay-allocated path: served.
    let published = publish(
        &client,
        &base,
        json!({"tenant_id": "tenant-a", "task_id": "task-1", "challenge_label": "Acme"}),
    )
    .await;
    let path = published["artifact_path"].as_str().unwrap();
    assert!(path.starts_with(tmp.path().join("artifacts").to_str().unwrap()));
    std::fs::write(path, b"\x89PNG fake").unwrap();

    let request_id = published["request_id"].as_str().unwrap();
    let resp = reqwest::get(format!("{base}/api/verification/{request_id}/artifact"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(&resp.bytes().await.unwrap()[..], b"\x89PNG fake");

    // A path escaping the artifact dir: refused.
    let outside = tmp.path().join("outside.png");
    std::fs::write(&outside, b"secret").unwrap();
    let sneaky = tmp.path().join("artifacts").join("..").join("outside.png");
    let published = publish(
        &client,
        &base,
        json!({
            "tenant_id": "tenant-a",
            "task_id": "task-2",
            "challenge_label": "Acme",
            "artifact_path": sneaky,
        }),
    )
    .await;
    let request_id = published["request_id"].as_str().unwrap();
    let resp = reqwest::get(format!("{base}/api/verification/{request_id}/artifact"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn test_publish_rejects_bad_ids() {
    let (base, _state, _tmp) = start_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/api/verification"))
        .json(&json!({"tenant_id": "../etc", "task_id": "task-1", "challenge_label": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_publish_into_another_tenants_artifacts_is_forbidden() {
    let (base, state, _tmp) = start_test_server().await;
    let client = reqwest::Client::new();

    let theirs = publish(
        &client,
        &base,
        json!({"tenant_id": "tenant-b", "task_id": "task-1", "challenge_label": "Acme"}),
    )
    .await;
    let b_path = theirs["artifact_path"].as_str().unwrap();
    std::fs::write(b_path, b"tenant-b screenshot").unwrap();

    let resp = client
        .post(format!("{base}/api/verification"))
        .json(&json!({
            "tenant_id": "tenant-a",
            "task_id": "task-9",
            "challenge_label": "x",
            "artifact_path": b_path,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(resp.json::<Value>().await.unwrap()["code"], "forbidden");
    assert_eq!(state.relay.pending_count(), 1);
}
