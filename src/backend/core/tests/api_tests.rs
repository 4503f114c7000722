//! Tests for the REST API, driven through the router without a socket.
//!
//! Tests cover:
//! - Health and metrics endpoints
//! - Webhook registration, listing, update, rotation and deletion
//! - Event triggering
//! - Queue status, job lookup and clean
//! - Inbound signature verification
//! - Error responses

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use courier_core::api::{build_router, AppState};
use courier_core::config::WebhookSettings;
use courier_core::jobs::QueueManager;
use courier_core::telemetry::MetricsRegistry;
use courier_core::webhooks::{compute_signature, WebhookDispatcher, WebhookRequestBody};
use serde_json::{json, Value};
use tower::ServiceExt;

const INBOUND_SECRET: &str = "inbound-test-secret";

fn app() -> Router {
    let settings = WebhookSettings {
        inbound_secret: Some(INBOUND_SECRET.to_string()),
        ..WebhookSettings::default()
    };
    let dispatcher =
        WebhookDispatcher::in_memory(Arc::new(QueueManager::in_memory()), settings).unwrap();
    build_router(AppState::new(dispatcher, MetricsRegistry::disabled()))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn register(app: &Router, events: Value) -> Value {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/webhooks",
        Some(json!({"url": "https://example.com/hook", "events": events})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["data"].clone()
}

// ============================================================================
// Health & metrics
// ============================================================================

#[tokio::test]
async fn test_health() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn test_metrics_endpoint_responds() {
    let app = app();
    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Webhooks
// ============================================================================

#[tokio::test]
async fn test_secret_only_returned_on_create_and_rotate() {
    let app = app();
    let created = register(&app, json!(["order.created"])).await;
    let id = created["id"].as_str().unwrap().to_string();
    let secret = created["secret"].as_str().unwrap().to_string();
    assert_eq!(secret.len(), 64);

    let (status, body) = send(&app, Method::GET, &format!("/api/v1/webhooks/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].get("secret").is_none());

    let (_, body) = send(&app, Method::GET, "/api/v1/webhooks", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert!(body["data"][0].get("secret").is_none());

    let (_, body) = send(
        &app,
        Method::PATCH,
        &format!("/api/v1/webhooks/{}", id),
        Some(json!({"description": "orders"})),
    )
    .await;
    assert_eq!(body["data"]["description"], "orders");
    assert!(body["data"].get("secret").is_none());

    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/api/v1/webhooks/{}", id),
        Some(json!({"rotate_secret": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = body["data"]["secret"].as_str().unwrap();
    assert_ne!(rotated, secret);
}

#[tokio::test]
async fn test_invalid_registration_is_rejected() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/webhooks",
        Some(json!({"url": "ftp://example.com", "events": ["a"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let app = app();
    let created = register(&app, json!(["a"])).await;
    let uri = format!("/api/v1/webhooks/{}", created["id"].as_str().unwrap());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "SUBSCRIPTION_NOT_FOUND");

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deliveries_empty_for_new_webhook() {
    let app = app();
    let created = register(&app, json!(["a"])).await;
    let uri = format!("/api/v1/webhooks/{}/deliveries", created["id"].as_str().unwrap());

    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

// ============================================================================
// Events & queues
// ============================================================================

#[tokio::test]
async fn test_trigger_event_reports_enqueued_jobs() {
    let app = app();
    register(&app, json!(["order.created"])).await;
    register(&app, json!(["order.created", "order.paid"])).await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/events",
        Some(json!({"event": "order.created", "payload": {"id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["enqueued"], 2);

    // Nothing processes the queue here, so the jobs stay waiting.
    let (status, body) = send(&app, Method::GET, "/api/v1/queues/webhooks/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["queue"], "webhooks");
    assert_eq!(body["data"]["backend"], "memory");
    assert_eq!(body["data"]["waiting"], 2);
}

#[tokio::test]
async fn test_status_of_unknown_queue_is_empty() {
    let app = app();
    let (status, body) = send(&app, Method::GET, "/api/v1/queues/no-such-queue/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["waiting"], 0);
    assert_eq!(body["data"]["failed"], 0);
}

#[tokio::test]
async fn test_job_lookup() {
    let app = app();

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/api/v1/queues/webhooks/jobs/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "JOB_NOT_FOUND");

    let (status, _) = send(&app, Method::GET, "/api/v1/queues/webhooks/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_clean_queue() {
    let app = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/queues/webhooks/clean",
        Some(json!({"grace_ms": 0, "status": "completed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], 0);
}

// ============================================================================
// Inbound
// ============================================================================

fn inbound_request(event_header: Option<&str>, signature: Option<&str>, body: &WebhookRequestBody) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/inbound")
        .header("content-type", "application/json");
    if let Some(event) = event_header {
        builder = builder.header("X-Webhook-Event", event);
    }
    if let Some(signature) = signature {
        builder = builder.header("X-Webhook-Signature", signature);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn signed_body(secret: &str) -> WebhookRequestBody {
    let payload = json!({"order_id": 9});
    WebhookRequestBody {
        event: "order.created".into(),
        signature: compute_signature("order.created", &payload, secret),
        payload,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_inbound_accepts_valid_signature() {
    let app = app();
    let body = signed_body(INBOUND_SECRET);
    let request = inbound_request(Some("order.created"), Some(&body.signature), &body);

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_inbound_rejects_bad_or_missing_signature() {
    let app = app();

    let forged = signed_body("someone-else");
    let response = app
        .clone()
        .oneshot(inbound_request(Some("order.created"), Some(&forged.signature), &forged))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = signed_body(INBOUND_SECRET);
    let response = app
        .clone()
        .oneshot(inbound_request(Some("order.created"), None, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(inbound_request(None, Some(&body.signature), &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
