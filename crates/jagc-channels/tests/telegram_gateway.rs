//! End-to-end gateway tests against a mocked Telegram Bot API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jagc_channels::{TelegramGateway, TelegramGatewayConfig};
use jagc_core::{EchoExecutor, ProgressBus, RunExecutor, RunService};
use jagc_store::{ImageScope, Store};
use jagc_types::{DeliveryMode, ImagePayload, IngestRequest, Run, RunOutput, RunStatus};

struct Harness {
    server: MockServer,
    gateway: Arc<TelegramGateway>,
    runs: Arc<RunService>,
    store: Store,
}

async fn mount_send_mocks(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/botTEST/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "message_id": 900, "chat": { "id": 101 } }
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/editMessageText"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/deleteMessage"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })),
        )
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/sendChatAction"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": true })),
        )
        .mount(server)
        .await;
}

async fn mount_empty_updates_fallback(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "ok": true, "result": [] }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(server)
        .await;
}

async fn harness_with_executor(executor: Arc<dyn RunExecutor>, progress: ProgressBus) -> Harness {
    let server = MockServer::start().await;
    mount_send_mocks(&server).await;

    let store = Store::open_in_memory().unwrap();
    let runs = RunService::new(store.clone(), executor, progress);

    let mut config =
        TelegramGatewayConfig::new("TEST".into(), vec!["202".into(), "1".into()]);
    config.api_base = server.uri();
    config.poll_timeout_secs = 0;
    let gateway = TelegramGateway::new(config, runs.clone(), store.clone()).unwrap();

    Harness {
        server,
        gateway,
        runs,
        store,
    }
}

async fn echo_harness() -> Harness {
    let progress = ProgressBus::new();
    let executor = Arc::new(EchoExecutor::new(progress.clone()));
    harness_with_executor(executor, progress).await
}

fn text_update(update_id: i64, chat_id: i64, from_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "from": { "id": from_id },
            "chat": { "id": chat_id },
            "text": text,
        }
    })
}

/// True once a sendMessage or editMessageText body carried `needle`.
async fn saw_outgoing_text(server: &MockServer, needle: &str) -> bool {
    let requests = server.received_requests().await.unwrap_or_default();
    requests.iter().any(|r| {
        let p = r.url.path();
        (p.ends_with("/sendMessage") || p.ends_with("/editMessageText"))
            && String::from_utf8_lossy(&r.body).contains(needle)
    })
}

async fn wait_for_outgoing_text(server: &MockServer, needle: &str) -> bool {
    for _ in 0..100 {
        if saw_outgoing_text(server, needle).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn single_chat_message_echoes_back() {
    let h = echo_harness().await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(5001, 101, 202, "hello adapter")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "hello adapter").await);

    // Replaying the same ingest returns the very run the update created,
    // with the mapped keys.
    let replay = IngestRequest {
        source: "telegram".into(),
        thread_key: "telegram:chat:101".into(),
        user_key: Some("telegram:user:202".into()),
        delivery_mode: DeliveryMode::FollowUp,
        idempotency_key: Some("telegram:update:5001".into()),
        input_text: "hello adapter".into(),
        images: Vec::new(),
    };
    let outcome = h.runs.ingest(&replay).await.unwrap();
    assert!(outcome.deduplicated);
    assert_eq!(outcome.run.thread_key, "telegram:chat:101");
    assert_eq!(outcome.run.user_key.as_deref(), Some("telegram:user:202"));
    assert_eq!(outcome.run.delivery_mode, DeliveryMode::FollowUp);

    h.gateway.stop();
}

#[tokio::test]
async fn steer_command_maps_to_steer_ingest() {
    let h = echo_harness().await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(5002, 101, 202, "/steer interrupt this run")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "interrupt this run").await);

    let replay = IngestRequest {
        source: "telegram".into(),
        thread_key: "telegram:chat:101".into(),
        user_key: Some("telegram:user:202".into()),
        delivery_mode: DeliveryMode::Steer,
        idempotency_key: Some("telegram:update:5002".into()),
        input_text: "interrupt this run".into(),
        images: Vec::new(),
    };
    let outcome = h.runs.ingest(&replay).await.unwrap();
    assert!(outcome.deduplicated);
    assert_eq!(outcome.run.delivery_mode, DeliveryMode::Steer);

    h.gateway.stop();
}

#[tokio::test]
async fn empty_steer_is_rejected_with_usage_hint() {
    let h = echo_harness().await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(5003, 101, 202, "/steer")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "Nothing to steer with").await);
    h.gateway.stop();
}

#[tokio::test]
async fn unauthorized_user_gets_exact_allow_command() {
    let h = echo_harness().await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(5004, 101, 999, "let me in")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "jagc allow-user 999").await);
    // And no run was created for the denied message.
    assert!(h
        .store
        .latest_running_run_for_thread("telegram:chat:101")
        .await
        .unwrap()
        .is_none());
    h.gateway.stop();
}

#[tokio::test]
async fn poll_survives_500_then_429_and_still_delivers() {
    let h = echo_harness().await;

    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry later",
            "parameters": { "retry_after": 0.05 }
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(6001, 101, 202, "after the storm")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    let started = Instant::now();
    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "after the storm").await);
    // At minimum the retry_after hint was honored on the way.
    assert!(started.elapsed() >= Duration::from_millis(50));
    h.gateway.stop();
}

#[tokio::test]
async fn photo_then_text_binds_buffered_image_to_run() {
    let h = echo_harness().await;

    Mock::given(method("POST"))
        .and(path("/botTEST/getFile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": { "file_id": "f-1", "file_path": "photos/f-1.jpg" }
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file/botTEST/photos/f-1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [
                {
                    "update_id": 2001,
                    "message": {
                        "message_id": 10,
                        "from": { "id": 1 },
                        "chat": { "id": 1 },
                        "photo": [
                            { "file_id": "f-0", "file_unique_id": "u-0", "width": 90, "height": 90 },
                            { "file_id": "f-1", "file_unique_id": "u-1", "width": 1280, "height": 1280 }
                        ]
                    }
                },
                text_update(2002, 1, 1, "describe buffered image")
            ]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(wait_for_outgoing_text(&h.server, "describe buffered image").await);

    let scope = ImageScope {
        source: "telegram".into(),
        thread_key: "telegram:chat:1".into(),
        user_key: "telegram:user:1".into(),
    };
    assert_eq!(h.store.pending_buffer_stats(&scope).await.unwrap().count, 0);

    let replay = IngestRequest {
        source: "telegram".into(),
        thread_key: "telegram:chat:1".into(),
        user_key: Some("telegram:user:1".into()),
        delivery_mode: DeliveryMode::FollowUp,
        idempotency_key: Some("telegram:update:2002".into()),
        input_text: "describe buffered image".into(),
        images: Vec::new(),
    };
    let outcome = h.runs.ingest(&replay).await.unwrap();
    assert!(outcome.deduplicated);
    let bound = h
        .store
        .list_run_input_images(&outcome.run.run_id)
        .await
        .unwrap();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].position, 0);
    assert_eq!(bound[0].image_bytes, vec![0xFF, 0xD8, 0xFF]);
    assert!(bound[0].expires_at > chrono::Utc::now());

    h.gateway.stop();
}

#[tokio::test]
async fn cancel_acknowledges_and_suppresses_abort_error() {
    struct StallExecutor;

    #[async_trait]
    impl RunExecutor for StallExecutor {
        async fn execute(
            &self,
            run: &Run,
            _images: Vec<ImagePayload>,
        ) -> anyhow::Result<RunOutput> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RunOutput::message(run.input_text.clone(), run.delivery_mode))
        }
    }

    let progress = ProgressBus::new();
    let h = harness_with_executor(Arc::new(StallExecutor), progress).await;

    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": [text_update(7001, 101, 202, "take your time")]
        })))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/botTEST/getUpdates"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "ok": true,
                    "result": [text_update(7002, 101, 202, "/cancel")]
                }))
                .set_delay(Duration::from_millis(150)),
        )
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    mount_empty_updates_fallback(&h.server).await;

    h.gateway.start();
    assert!(
        wait_for_outgoing_text(
            &h.server,
            "Stopped the active run. Session context is preserved."
        )
        .await
    );

    // The run really was failed with the abort sentinel...
    let replay = IngestRequest {
        source: "telegram".into(),
        thread_key: "telegram:chat:101".into(),
        user_key: Some("telegram:user:202".into()),
        delivery_mode: DeliveryMode::FollowUp,
        idempotency_key: Some("telegram:update:7001".into()),
        input_text: "take your time".into(),
        images: Vec::new(),
    };
    let outcome = h.runs.ingest(&replay).await.unwrap();
    assert!(outcome.deduplicated);
    assert_eq!(outcome.run.status, RunStatus::Failed);
    assert_eq!(
        outcome.run.error_message.as_deref(),
        Some("This operation was aborted")
    );

    // ...but the user never sees the aborted-error line.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!saw_outgoing_text(&h.server, "❌").await);

    h.gateway.stop();
}
