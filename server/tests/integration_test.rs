//! Integration tests for EchoVault
//!
//! These tests drive the HTTP router end to end against a file database:
//! - Trigger endpoint dispatch and status
//! - Public viewing page with PIN gate and view recording
//! - Check-ins, WhatsApp keywords and panic fires

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use echovault::api::build_router;
use echovault::app::AppState;
use echovault::clock::{SharedClock, SystemClock};
use echovault::config::ServerConfig;
use echovault::database::{create_pool, CreateConditionRequest, CreateMessageRequest, Repository};
use echovault::domain::{ConditionKind, PanicConfig, PanicMethod, Recipient};
use echovault::error::Result;
use echovault::providers::{EmailProvider, LogWhatsAppProvider};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct CountingEmail {
    calls: AtomicUsize,
}

#[async_trait]
impl EmailProvider for CountingEmail {
    async fn send_email(
        &self,
        _to: &str,
        _subject: &str,
        _html: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestApp {
    router: Router,
    repo: Repository,
    email: Arc<CountingEmail>,
    _temp: TempDir,
}

/// Helper to build the app over a fresh database
async fn create_test_app(config: ServerConfig) -> TestApp {
    let temp_dir = TempDir::new().unwrap();
    let pool = create_pool(&temp_dir.path().join("test.db")).await.unwrap();

    let email = Arc::new(CountingEmail::default());
    let clock: SharedClock = Arc::new(SystemClock);
    let state = AppState::with_providers(
        ServerConfig {
            email_retry_delay: std::time::Duration::ZERO,
            ..config
        },
        pool,
        clock,
        email.clone(),
        Arc::new(LogWhatsAppProvider),
    );

    TestApp {
        router: build_router(state.clone()),
        repo: state.repo,
        email,
        _temp: temp_dir,
    }
}

fn recipient() -> Recipient {
    Recipient {
        id: "r1".to_string(),
        name: "Ana".to_string(),
        email: "ana@example.com".to_string(),
        phone: Some("+15550002".to_string()),
    }
}

async fn create_message(repo: &Repository, title: &str) -> String {
    repo.create_message(CreateMessageRequest {
        user_id: "owner".to_string(),
        title: title.to_string(),
        content: Some("Look after the cat.".to_string()),
        ..Default::default()
    })
    .await
    .unwrap()
    .id
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, _, text) = send(router, request).await;
    (status, serde_json::from_str(&text).unwrap())
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Option<String>, String) {
    send(router, Request::get(uri).body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn test_overdue_message_delivery_and_viewing() {
    let app = create_test_app(ServerConfig::default()).await;
    let message_id = create_message(&app.repo, "Final letter").await;

    let mut req = CreateConditionRequest::new(&message_id, ConditionKind::NoCheckIn);
    req.hours_threshold = Some(24);
    req.minutes_threshold = Some(0);
    req.last_checked = Some(Utc::now() - Duration::hours(25));
    req.recipients = vec![recipient()];
    req.pin_code = Some("4321".to_string());
    app.repo.create_condition(req).await.unwrap();

    // Trigger
    let (status, report) = post_json(&app.router, "/notify", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["due"], 1);
    assert_eq!(report["sent"], 1);
    assert_eq!(report["source"], "api");
    assert_eq!(app.email.calls.load(Ordering::SeqCst), 1);

    let deliveries = app.repo.list_deliveries_for_message(&message_id).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery_id = deliveries[0].delivery_id.clone();

    // PIN gate first
    let page_uri = format!(
        "/access?id={}&recipient=ana%40example.com&delivery={}",
        message_id, delivery_id
    );
    let (status, content_type, html) = get(&app.router, &page_uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert!(html.contains("PIN required"));
    assert!(!html.contains("Look after the cat."));

    let pin_body = |pin: &str| {
        json!({
            "pin": pin,
            "messageId": message_id,
            "deliveryId": delivery_id,
            "recipientEmail": "ana@example.com",
        })
    };
    let (_, wrong) = post_json(&app.router, "/access/verify-pin", pin_body("0000")).await;
    assert_eq!(wrong["success"], false);

    let (status, right) = post_json(&app.router, "/access/verify-pin", pin_body("4321")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(right["success"], true);

    // Verified, so the content is shown
    let (_, _, html) = get(&app.router, &page_uri).await;
    assert!(html.contains("Final letter"));
    assert!(html.contains("Look after the cat."));

    let (status, viewed) = post_json(
        &app.router,
        "/access/record-view",
        json!({ "messageId": message_id, "deliveryId": delivery_id, "deviceInfo": "test" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(viewed["success"], true);
    let record = app.repo.get_delivery(&delivery_id).await.unwrap();
    assert_eq!(record.viewed_count, 2);

    // Delivered once, so nothing is left to evaluate
    let (_, _, status_body) = get(&app.router, "/notify/status").await;
    let status_json: Value = serde_json::from_str(&status_body).unwrap();
    assert_eq!(status_json["status"], "ok");
    assert_eq!(status_json["activeConditions"], 0);
    assert_eq!(status_json["dedupBackend"], "memory");

    let (_, report) = post_json(&app.router, "/notify", json!({})).await;
    assert_eq!(report["due"], 0);
    assert_eq!(app.email.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_access_page_renders_html_errors() {
    let app = create_test_app(ServerConfig::default()).await;
    let message_id = create_message(&app.repo, "Private").await;
    let mut req = CreateConditionRequest::new(&message_id, ConditionKind::ScheduledDate);
    req.trigger_date = Some(Utc::now() + Duration::days(1));
    req.recipients = vec![recipient()];
    app.repo.create_condition(req).await.unwrap();

    let (status, content_type, html) = get(
        &app.router,
        &format!("/access?id={}&recipient=eve%40example.com", message_id),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert!(html.contains("not allowed"));

    let (status, _, html) = get(&app.router, "/access?id=missing&recipient=ana%40example.com").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(html.contains("could not be found"));

    let (status, _, _) = get(&app.router, "/access").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_trigger_token_required_when_configured() {
    let app = create_test_app(ServerConfig {
        trigger_token: Some("s3cret".to_string()),
        ..Default::default()
    })
    .await;

    let (status, _) = post_json(&app.router, "/notify", json!({ "testMode": true })).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let request = Request::post("/notify")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::from(json!({ "testMode": true }).to_string()))
        .unwrap();
    let (status, _, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["testMode"], true);
}

#[tokio::test]
async fn test_check_in_over_http_and_whatsapp() {
    let app = create_test_app(ServerConfig::default()).await;
    app.repo
        .upsert_profile("owner", Some("owner@example.com"), Some("+15550001"))
        .await
        .unwrap();

    let message_id = create_message(&app.repo, "Letter").await;
    let mut req = CreateConditionRequest::new(&message_id, ConditionKind::NoCheckIn);
    req.hours_threshold = Some(24);
    req.last_checked = Some(Utc::now() - Duration::hours(23));
    req.recipients = vec![recipient()];
    let condition = app.repo.create_condition(req).await.unwrap();

    let (status, report) = post_json(&app.router, "/check-in", json!({ "userId": "owner" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["conditionsUpdated"], 1);
    let refreshed = app.repo.get_condition(&condition.id).await.unwrap();
    assert!(refreshed.last_checked > Utc::now() - Duration::minutes(1));

    let (status, _) = post_json(&app.router, "/check-in", json!({ "userId": "stranger" })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, handled) = post_json(
        &app.router,
        "/whatsapp/inbound",
        json!({ "from": "+15550001", "body": " checkin " }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(handled["handled"], true);
    assert_eq!(handled["action"], "check_in");

    let (_, unmatched) = post_json(
        &app.router,
        "/whatsapp/inbound",
        json!({ "from": "+15550001", "body": "hello" }),
    )
    .await;
    assert_eq!(unmatched["handled"], false);

    let (status, _) = post_json(
        &app.router,
        "/whatsapp/inbound",
        json!({ "from": "+19990000", "body": "CHECKIN" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_panic_trigger_over_http_is_deduplicated() {
    let app = create_test_app(ServerConfig::default()).await;
    app.repo
        .upsert_profile("owner", None, Some("+15550001"))
        .await
        .unwrap();

    let message_id = create_message(&app.repo, "Help").await;
    let config = PanicConfig::default()
        .with_methods(&[PanicMethod::App, PanicMethod::Whatsapp])
        .and_then(|c| c.with_trigger_keyword(Some("RED")))
        .unwrap();
    let mut req = CreateConditionRequest::new(&message_id, ConditionKind::PanicTrigger);
    req.panic_config = Some(config);
    req.recipients = vec![recipient()];
    app.repo.create_condition(req).await.unwrap();

    let (status, first) = post_json(
        &app.router,
        "/panic/trigger",
        json!({ "messageId": message_id, "userId": "owner" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["success"], true);
    assert_eq!(first["duplicate"], false);
    assert_eq!(first["keepArmed"], true);

    // Keyword path hits the same 30 second guard
    let (_, second) = post_json(
        &app.router,
        "/whatsapp/inbound",
        json!({ "from": "+15550001", "body": "red" }),
    )
    .await;
    assert_eq!(second["action"], "panic");
    assert_eq!(second["panic"]["duplicate"], true);
    assert_eq!(app.email.calls.load(Ordering::SeqCst), 1);

    let (status, _) = post_json(
        &app.router,
        "/panic/trigger",
        json!({ "messageId": message_id, "userId": "someone-else" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_owner_actions_require_token_when_configured() {
    let app = create_test_app(ServerConfig {
        trigger_token: Some("s3cret".to_string()),
        ..Default::default()
    })
    .await;

    let message_id = create_message(&app.repo, "Help").await;
    let mut req = CreateConditionRequest::new(&message_id, ConditionKind::PanicTrigger);
    req.panic_config = Some(PanicConfig::default());
    req.recipients = vec![recipient()];
    app.repo.create_condition(req).await.unwrap();

    let check_in = json!({ "userId": "owner" });
    let fire = json!({ "messageId": message_id, "userId": "owner" });

    let (status, _) = post_json(&app.router, "/check-in", check_in.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = post_json(&app.router, "/panic/trigger", fire.clone()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(app.email.calls.load(Ordering::SeqCst), 0);

    let authorized = |uri: &str, body: &Value| {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    // The owner must be named when firing
    let anonymous = json!({ "messageId": message_id });
    let (status, _, _) = send(&app.router, authorized("/panic/trigger", &anonymous)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _, body) = send(&app.router, authorized("/check-in", &check_in)).await;
    assert_eq!(status, StatusCode::OK);
    let report: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["conditionsUpdated"], 1);

    let (status, _, body) = send(&app.router, authorized("/panic/trigger", &fire)).await;
    assert_eq!(status, StatusCode::OK);
    let outcome: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(outcome["success"], true);
    assert_eq!(app.email.calls.load(Ordering::SeqCst), 1);
}
