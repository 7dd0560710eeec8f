//! End-to-end tests driving the HTTP router.

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use signalgate_backend::{
    api::{create_router, AppState},
    auth::{signature::sign, ConsumerAuth},
    clock::{ClockSource, ManualClock, SharedClock},
    config::{PipelineConfig, ProducerConfig, ProducerRegistry},
    middleware::{RateLimitConfig, RateLimiter},
    storage::Database,
    workflow::ApprovalWorkflow,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const PRODUCER: &str = "alpha";
const SECRET: &str = "alpha-secret-0123456789";
const TOKEN_SECRET: &str = "approval-token-secret-0123456789abcdef";
const CONSUMER_KEY: &str = "consumer-key-42";
const DEVICE: &str = "laptop-7f3a";

const EURUSD_BUY: &str =
    r#"{"instrument":"EURUSD","side":"buy","order":{"type":"limit","price":1.0845}}"#;
const EURUSD_SELL: &str =
    r#"{"instrument":"EURUSD","side":"sell","order":{"type":"limit","price":1.0845}}"#;

struct Harness {
    app: Router,
    workflow: Arc<ApprovalWorkflow>,
    clock: ManualClock,
}

fn build(db: Database, clock: &ManualClock, rate: RateLimitConfig) -> Harness {
    let shared: SharedClock = Arc::new(clock.clone());
    let mut producer = ProducerConfig::new(PRODUCER, SECRET);
    producer.allowed_instruments = vec!["EURUSD".to_string(), "GBPUSD".to_string()];

    let workflow = Arc::new(ApprovalWorkflow::new(
        db,
        shared.clone(),
        &PipelineConfig::new(TOKEN_SECRET),
        ProducerRegistry::new([producer]),
        RateLimiter::new(rate, shared),
    ));
    let app = create_router(AppState {
        workflow: workflow.clone(),
        consumer_auth: Arc::new(ConsumerAuth::new(Some(CONSUMER_KEY))),
    });

    Harness {
        app,
        workflow,
        clock: clock.clone(),
    }
}

fn harness() -> Harness {
    let clock = ManualClock::from_unix_secs(1_772_443_800);
    build(
        Database::open_in_memory().unwrap(),
        &clock,
        RateLimitConfig::default(),
    )
}

fn webhook(body: &str, timestamp: &str, key: &str) -> Request<Body> {
    let signature = sign(SECRET.as_bytes(), timestamp, body.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/signals")
        .header("content-type", "application/json")
        .header("X-Producer-Id", PRODUCER)
        .header("X-Signature", signature)
        .header("X-Timestamp", timestamp)
        .header("Idempotency-Key", key)
        .header("X-Device-Fingerprint", DEVICE)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn redeem(token: &str, device: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/approvals/redeem")
        .header("Authorization", format!("Bearer {}", token))
        .header("X-Device-Fingerprint", device)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn now_secs(clock: &ManualClock) -> String {
    clock.now().timestamp().to_string()
}

#[tokio::test]
async fn eurusd_approval_scenario() {
    let h = harness();

    let (status, first) = send(
        &h.app,
        webhook(EURUSD_BUY, &now_secs(&h.clock), "sig-123"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    assert_eq!(first["cursor"], 0);
    assert_eq!(first["replayed"], false);

    let expires_at: chrono::DateTime<chrono::Utc> =
        serde_json::from_value(first["expires_at"].clone()).unwrap();
    assert_eq!((expires_at - h.clock.now()).num_seconds(), 120);

    // Re-sent 50ms later, re-signed with a fresh timestamp header.
    h.clock.advance(chrono::Duration::milliseconds(50));
    let fresh_ts = h.clock.now().to_rfc3339();
    let (status, second) = send(&h.app, webhook(EURUSD_BUY, &fresh_ts, "sig-123")).await;
    assert_eq!(status, StatusCode::OK, "{}", second);
    assert_eq!(second["signal_id"], first["signal_id"]);
    assert_eq!(second["approval_token"], first["approval_token"]);
    assert_eq!(second["replayed"], true);

    // Same key, different payload.
    h.clock.advance(chrono::Duration::milliseconds(50));
    let (status, conflict) = send(
        &h.app,
        webhook(EURUSD_SELL, &h.clock.now().to_rfc3339(), "sig-123"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["error"], "idempotency_key_reused");
    assert_eq!(conflict["retryable"], false);
    assert_eq!(h.workflow.signals().head(PRODUCER).unwrap(), 1);

    // The execution engine redeems once.
    let token = first["approval_token"].as_str().unwrap();
    let (status, signal) = send(&h.app, redeem(token, DEVICE)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(signal["instrument"], "EURUSD");
    assert_eq!(signal["side"], "buy");
    assert_eq!(signal["order"]["type"], "limit");

    let (status, again) = send(&h.app, redeem(token, DEVICE)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(again["error"], "already_redeemed");
}

#[tokio::test]
async fn replayed_and_stale_deliveries_are_rejected() {
    let h = harness();
    let ts = now_secs(&h.clock);

    let (status, _) = send(&h.app, webhook(EURUSD_BUY, &ts, "k-1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.app, webhook(EURUSD_BUY, &ts, "k-1")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_delivery");
    assert_eq!(body["category"], "replay");

    // Once the window has passed the same capture fails the skew check instead.
    h.clock.advance(chrono::Duration::seconds(301));
    let (status, body) = send(&h.app, webhook(EURUSD_BUY, &ts, "k-1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "clock_skew_exceeded");
}

#[tokio::test]
async fn authentication_failures_are_distinct() {
    let h = harness();
    let ts = now_secs(&h.clock);

    let mut request = webhook(EURUSD_BUY, &ts, "k-1");
    request
        .headers_mut()
        .insert("X-Signature", "00".repeat(32).parse().unwrap());
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "bad_signature");
    assert_eq!(body["stage"], "received");

    let mut request = webhook(EURUSD_BUY, &ts, "k-1");
    request
        .headers_mut()
        .insert("X-Producer-Id", "mallory".parse().unwrap());
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unknown_producer");

    let mut request = webhook(EURUSD_BUY, &ts, "k-1");
    request.headers_mut().remove("X-Timestamp");
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing_timestamp");
}

#[tokio::test]
async fn policy_and_payload_errors() {
    let h = harness();

    let gold = r#"{"instrument":"XAUUSD","side":"buy"}"#;
    let (status, body) = send(&h.app, webhook(gold, &now_secs(&h.clock), "k-1")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "instrument_not_allowed");

    h.clock.advance(chrono::Duration::seconds(1));
    let broken = r#"{"instrument":"EURUSD","side":"hold"}"#;
    let (status, body) = send(&h.app, webhook(broken, &now_secs(&h.clock), "k-2")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed_payload");

    assert_eq!(h.workflow.signals().head(PRODUCER).unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_persist_one_signal() {
    let h = harness();
    let base = h.clock.now().timestamp();

    // Each producer retry is re-signed, so every delivery has its own timestamp.
    let mut handles = Vec::new();
    for i in 0..12 {
        let app = h.app.clone();
        let request = webhook(EURUSD_BUY, &(base - i).to_string(), "burst-key");
        handles.push(tokio::spawn(async move { send(&app, request).await }));
    }

    let mut signal_ids = HashSet::new();
    let mut tokens = HashSet::new();
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK, "{}", body);
        signal_ids.insert(body["signal_id"].as_str().unwrap().to_string());
        tokens.insert(body["approval_token"].as_str().unwrap().to_string());
    }

    assert_eq!(signal_ids.len(), 1);
    assert_eq!(tokens.len(), 1);
    assert_eq!(h.workflow.signals().head(PRODUCER).unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn token_redemption_race_across_connections() {
    let temp = tempfile::NamedTempFile::new().unwrap();
    let path = temp.path().to_str().unwrap().to_string();
    let clock = ManualClock::from_unix_secs(1_772_443_800);

    // Two gateway instances sharing one database file.
    let a = build(Database::open(&path).unwrap(), &clock, RateLimitConfig::default());
    let b = build(Database::open(&path).unwrap(), &clock, RateLimitConfig::default());

    let (status, issued) = send(&a.app, webhook(EURUSD_BUY, &now_secs(&clock), "k-1")).await;
    assert_eq!(status, StatusCode::OK);
    let token = issued["approval_token"].as_str().unwrap().to_string();

    let wa = a.workflow.clone();
    let wb = b.workflow.clone();
    let ta = token.clone();
    let tb = token.clone();
    let ra = tokio::task::spawn_blocking(move || wa.redeem(Some(&ta), Some(DEVICE)));
    let rb = tokio::task::spawn_blocking(move || wb.redeem(Some(&tb), Some(DEVICE)));

    let results = [ra.await.unwrap(), rb.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.reason() == "already_redeemed"));
}

#[tokio::test]
async fn token_bound_to_device_and_expires() {
    let h = harness();
    let (_, issued) = send(&h.app, webhook(EURUSD_BUY, &now_secs(&h.clock), "k-1")).await;
    let token = issued["approval_token"].as_str().unwrap().to_string();

    let (status, body) = send(&h.app, redeem(&token, "phone-0001")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "device_mismatch");

    h.clock.advance(chrono::Duration::seconds(121));
    let (status, body) = send(&h.app, redeem(&token, DEVICE)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "token_expired");
}

#[tokio::test]
async fn cursor_endpoint_pages_without_gaps() {
    let h = harness();
    for i in 0..5 {
        h.clock.advance(chrono::Duration::seconds(1));
        let (status, _) = send(
            &h.app,
            webhook(EURUSD_BUY, &now_secs(&h.clock), &format!("k-{}", i)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let unauthorized = Request::builder()
        .uri("/signals?producer_id=alpha")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, unauthorized).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut cursor = 0;
    let mut seen = Vec::new();
    loop {
        let request = Request::builder()
            .uri(format!(
                "/signals?producer_id=alpha&from_cursor={}&limit=2",
                cursor
            ))
            .header("Authorization", format!("Bearer {}", CONSUMER_KEY))
            .body(Body::empty())
            .unwrap();
        let (status, page) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::OK);

        let signals = page["signals"].as_array().unwrap();
        if signals.is_empty() {
            break;
        }
        seen.extend(signals.iter().map(|s| s["cursor"].as_u64().unwrap()));
        cursor = page["next_cursor"].as_u64().unwrap();
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    let past_end = Request::builder()
        .uri(format!(
            "/signals?producer_id=alpha&from_cursor={}",
            u64::MAX
        ))
        .header("Authorization", format!("Bearer {}", CONSUMER_KEY))
        .body(Body::empty())
        .unwrap();
    let (status, page) = send(&h.app, past_end).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["count"], 0);
    assert_eq!(page["next_cursor"].as_u64(), Some(u64::MAX));
}

#[tokio::test]
async fn rate_limit_returns_retry_after() {
    let clock = ManualClock::from_unix_secs(1_772_443_800);
    let h = build(
        Database::open_in_memory().unwrap(),
        &clock,
        RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            burst: 0,
        },
    );

    for i in 0..2 {
        h.clock.advance(chrono::Duration::seconds(1));
        let (status, _) = send(
            &h.app,
            webhook(EURUSD_BUY, &now_secs(&h.clock), &format!("k-{}", i)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    h.clock.advance(chrono::Duration::seconds(1));
    let response = h
        .app
        .clone()
        .oneshot(webhook(EURUSD_BUY, &now_secs(&h.clock), "k-3"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "58");
}

#[tokio::test]
async fn health_is_public() {
    let h = harness();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}
