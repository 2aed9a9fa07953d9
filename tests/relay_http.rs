use std::sync::Arc;
use std::time::Duration;

use factorio_gpt_relay::config::{ConfigStore, ServiceConfig};
use factorio_gpt_relay::http::Upstream;
use factorio_gpt_relay::relay::RelayService;
use factorio_gpt_relay::server;
use httpmock::{Method::POST, MockServer};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct TestRelay {
    base_url: String,
    _config_dir: TempDir,
}

impl TestRelay {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn start_relay(upstream_base: &str, tweak: impl FnOnce(&mut ServiceConfig)) -> TestRelay {
    let config_dir = TempDir::new().unwrap();
    let store = ConfigStore::new(config_dir.path().join("config.json"));
    let mut config = ServiceConfig {
        api_key: Some("sk-test".to_string()),
        consent_acknowledged: true,
        ..ServiceConfig::default()
    };
    tweak(&mut config);
    let service = Arc::new(RelayService::new(
        config,
        store,
        Upstream::new(upstream_base).unwrap(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(service)).await.unwrap();
    });
    TestRelay {
        base_url: format!("http://{}", addr),
        _config_dir: config_dir,
    }
}

#[tokio::test]
async fn chat_round_trip_reports_rate_limit() {
    let upstream = MockServer::start_async().await;
    let chat = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer sk-test")
                .body_contains("\"model\":\"gpt-4o\"");
            then.status(200)
                .header("x-ratelimit-remaining-requests", "42")
                .header("x-ratelimit-remaining-tokens", "149000")
                .header("x-ratelimit-reset-requests", "12.5")
                .json_body(json!({
                    "id": "chatcmpl-1",
                    "choices": [{"message": {"role": "assistant", "content": "All clear."}}]
                }));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    // The payload names no model, so the configured default goes upstream.
    let client = reqwest::Client::new();
    let response = client
        .post(relay.url("/chat"))
        .json(&json!({"messages": [{"role": "user", "content": "iron ratio?"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["id"], "chatcmpl-1");
    assert_eq!(body["rate_limit"]["model"], "gpt-4o");
    assert_eq!(body["rate_limit"]["remaining_requests"], 42);
    assert_eq!(body["rate_limit"]["remaining_tokens"], 149000);
    chat.assert_async().await;

    // The committed snapshot is now visible on /status.
    let status: Value = client
        .get(relay.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["ready"], true);
    assert_eq!(status["error"], Value::Null);
    assert_eq!(status["default_model"], "gpt-4o");
    assert_eq!(status["rate_limit"]["remaining_requests"], 42);
    assert_eq!(status["profiles"]["gpt-4.1-mini"]["max_tokens"], 1024);
}

#[tokio::test]
async fn explicit_model_wins_over_the_default() {
    let upstream = MockServer::start_async().await;
    let chat = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("\"model\":\"gpt-4.1\"");
            then.status(200)
                .header("x-ratelimit-remaining-requests", "7")
                .json_body(json!({"id": "chatcmpl-2"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let client = reqwest::Client::new();
    let response = client
        .post(relay.url("/chat"))
        .json(&json!({"model": "gpt-4.1", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["rate_limit"]["model"], "gpt-4.1");
    chat.assert_async().await;
}

#[tokio::test]
async fn empty_chat_body_relays_the_default_model() {
    let upstream = MockServer::start_async().await;
    let chat = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("\"model\":\"gpt-4o\"");
            then.status(200).json_body(json!({"id": "chatcmpl-bare"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    // No body at all: relayed as an object holding only the default model.
    let client = reqwest::Client::new();
    let response = client.post(relay.url("/chat")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["id"], "chatcmpl-bare");
    chat.assert_async().await;
}

#[tokio::test]
async fn chat_without_key_never_reaches_upstream() {
    let upstream = MockServer::start_async().await;
    let chat = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({"id": "never"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |config| {
        config.api_key = None;
    })
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(relay.url("/chat"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["error"],
        "API key not configured. Run with --setup first."
    );
    chat.assert_hits_async(0).await;
}

#[tokio::test]
async fn chat_without_consent_is_refused() {
    let upstream = MockServer::start_async().await;
    let relay = start_relay(&upstream.base_url(), |config| {
        config.consent_acknowledged = false;
    })
    .await;

    let client = reqwest::Client::new();
    let response = client
        .post(relay.url("/chat"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Consent not acknowledged. Run with --setup to accept."
    );

    // /status reports the same blocker instead of failing.
    let status: Value = client
        .get(relay.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["ready"], false);
    assert_eq!(
        status["error"],
        "Consent not acknowledged. Run with --setup to accept."
    );
}

#[tokio::test]
async fn upstream_failure_keeps_the_last_snapshot() {
    let upstream = MockServer::start_async().await;
    let ok = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("x-ratelimit-remaining-requests", "42")
                .json_body(json!({"id": "chatcmpl-1"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let client = reqwest::Client::new();
    let seeded = client
        .post(relay.url("/chat"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(seeded.status(), 200);

    ok.delete_async().await;
    let denied = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("invalid key");
        })
        .await;

    let response = client
        .post(relay.url("/chat"))
        .json(&json!({"messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "OpenAI error 401: invalid key");
    denied.assert_async().await;

    // The failed call must not touch the snapshot.
    let status: Value = client
        .get(relay.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["rate_limit"]["remaining_requests"], 42);
    assert_eq!(status["rate_limit"]["model"], "gpt-4o");
}

#[tokio::test]
async fn malformed_chat_body_is_a_clean_500() {
    let upstream = MockServer::start_async().await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let client = reqwest::Client::new();
    let response = client
        .post(relay.url("/chat"))
        .header("content-type", "application/json")
        .body("pollution {")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid JSON payload");

    // The process shrugs it off; the next request is served normally.
    let status = client.get(relay.url("/status")).send().await.unwrap();
    assert_eq!(status.status(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_answers_while_chat_is_in_flight() {
    let upstream = MockServer::start_async().await;
    let _slow = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(1500))
                .json_body(json!({"id": "chatcmpl-slow"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let chat_url = relay.url("/chat");
    let chat = tokio::spawn(async move {
        reqwest::Client::new()
            .post(chat_url)
            .json(&json!({"messages": []}))
            .send()
            .await
            .unwrap()
            .status()
    });

    // Give the chat request time to reach the upstream, then poll status
    // with a timeout well under the upstream delay.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();
    for _ in 0..2 {
        let status = client.get(relay.url("/status")).send().await.unwrap();
        assert_eq!(status.status(), 200);
    }

    assert_eq!(chat.await.unwrap(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn racing_chats_commit_whole_snapshots() {
    let upstream = MockServer::start_async().await;
    let slow = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("\"model\":\"gpt-4.1\"");
            then.status(200)
                .delay(Duration::from_millis(800))
                .header("x-ratelimit-remaining-requests", "7")
                .header("x-ratelimit-remaining-tokens", "222222")
                .json_body(json!({"id": "chatcmpl-slow"}));
        })
        .await;
    let fast = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .body_contains("\"model\":\"gpt-4o\"");
            then.status(200)
                .header("x-ratelimit-remaining-requests", "99")
                .header("x-ratelimit-remaining-tokens", "111111")
                .header("x-ratelimit-reset-requests", "30")
                .json_body(json!({"id": "chatcmpl-fast"}));
        })
        .await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let slow_url = relay.url("/chat");
    let in_flight = tokio::spawn(async move {
        reqwest::Client::new()
            .post(slow_url)
            .json(&json!({"model": "gpt-4.1", "messages": []}))
            .send()
            .await
            .unwrap()
            .json::<Value>()
            .await
            .unwrap()
    });

    // The fast call lands and commits while the slow one is still waiting
    // on the upstream.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let client = reqwest::Client::new();
    let first: Value = client
        .post(relay.url("/chat"))
        .json(&json!({"model": "gpt-4o", "messages": []}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["rate_limit"]["remaining_requests"], 99);

    let second = in_flight.await.unwrap();
    assert_eq!(second["rate_limit"]["remaining_requests"], 7);
    slow.assert_async().await;
    fast.assert_async().await;

    // The cache holds the later commit wholesale; nothing of the earlier
    // snapshot (its reset field included) bleeds through.
    let status: Value = client
        .get(relay.url("/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["rate_limit"]["model"], "gpt-4.1");
    assert_eq!(status["rate_limit"]["remaining_requests"], 7);
    assert_eq!(status["rate_limit"]["remaining_tokens"], 222222);
    assert_eq!(status["rate_limit"]["reset_timestamp"], Value::Null);
}

#[tokio::test]
async fn unknown_paths_and_methods_get_json_404() {
    let upstream = MockServer::start_async().await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let client = reqwest::Client::new();
    let missing = client.get(relay.url("/nope")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "Not found");

    // Wrong method on a known path gets the same JSON body.
    let wrong = client.get(relay.url("/chat")).send().await.unwrap();
    assert_eq!(wrong.status(), 404);
    let body: Value = wrong.json().await.unwrap();
    assert_eq!(body["error"], "Not found");

    let wrong = client.post(relay.url("/status")).send().await.unwrap();
    assert_eq!(wrong.status(), 404);
}

#[tokio::test]
async fn options_probe_gets_the_cors_allowance() {
    let upstream = MockServer::start_async().await;
    let relay = start_relay(&upstream.base_url(), |_| {}).await;

    let client = reqwest::Client::new();
    let probe = client
        .request(reqwest::Method::OPTIONS, relay.url("/chat"))
        .send()
        .await
        .unwrap();
    assert_eq!(probe.status(), 204);
    assert_eq!(
        probe
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "GET, POST, OPTIONS"
    );

    // Unknown paths answer the probe too.
    let probe = client
        .request(reqwest::Method::OPTIONS, relay.url("/anywhere"))
        .send()
        .await
        .unwrap();
    assert_eq!(probe.status(), 204);

    // Ordinary responses carry the permissive origin header.
    let status = client.get(relay.url("/status")).send().await.unwrap();
    assert_eq!(
        status.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}
