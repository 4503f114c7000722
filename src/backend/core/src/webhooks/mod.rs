//! Outbound webhooks with HMAC signatures and per-attempt delivery records.
//!
//! - **WebhookDispatcher**: subscription CRUD and `trigger_event` fan-out
//! - **DeliveryHandler**: the job handler that signs and POSTs each event
//! - **signature**: canonical JSON and HMAC-SHA256 over `{event, payload}`
//! - **receiver**: verification of inbound signed requests
//! - **store**: `SubscriptionStore` / `DeliveryLog` seams, in memory or PostgreSQL

pub mod dispatcher;
pub mod models;
pub mod postgres;
pub mod receiver;
pub mod signature;
pub mod store;

pub use dispatcher::{DeliveryHandler, WebhookDispatcher};
pub use models::{
    DeliveryJob, DeliveryStatus, NewSubscription, SubscriptionUpdate, WebhookDelivery,
    WebhookRequestBody, WebhookSubscription,
};
pub use postgres::PgWebhookStore;
pub use receiver::verify_inbound;
pub use signature::{canonical_json, compute_signature, generate_secret, verify_signature};
pub use store::{DeliveryLog, InMemoryWebhookStore, SubscriptionStore};
