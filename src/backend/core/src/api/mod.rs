//! REST API for Courier.
//!
//! # Routes
//!
//! - `GET /health`, `GET /metrics`
//! - `/api/v1/webhooks` subscription CRUD and `/api/v1/webhooks/:id/deliveries`
//! - `POST /api/v1/events` fans an event out to matching subscriptions
//! - `/api/v1/queues/:name/...` status, job lookup and clean
//! - `POST /api/v1/inbound` verifies a signed webhook from another instance

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::jobs::QueueManager;
use crate::telemetry::MetricsRegistry;
use crate::webhooks::WebhookDispatcher;

pub use handlers::{
    CleanQueueRequest, QueueStatusResponse, TriggerEventRequest, TriggerEventResponse,
    WebhookView,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<QueueManager>,
    pub dispatcher: WebhookDispatcher,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(dispatcher: WebhookDispatcher, metrics: MetricsRegistry) -> Self {
        Self {
            manager: dispatcher.queues().clone(),
            dispatcher,
            metrics,
        }
    }
}

/// Build the API router.
///
/// ```rust,ignore
/// let state = AppState::new(dispatcher, telemetry.metrics);
/// let app = build_router(state);
/// ```
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route(
            "/webhooks",
            post(handlers::create_webhook).get(handlers::list_webhooks),
        )
        .route(
            "/webhooks/:id",
            get(handlers::get_webhook)
                .patch(handlers::update_webhook)
                .delete(handlers::delete_webhook),
        )
        .route("/webhooks/:id/deliveries", get(handlers::list_deliveries))
        .route("/events", post(handlers::trigger_event))
        .route("/queues/:name/status", get(handlers::queue_status))
        .route("/queues/:name/jobs/:id", get(handlers::get_job))
        .route("/queues/:name/clean", post(handlers::clean_queue))
        .route("/inbound", post(handlers::receive_inbound))
}

/// API response wrapper.
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
