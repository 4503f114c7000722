//! Verification of signed webhooks received from another Courier instance.

use axum::http::HeaderMap;

use super::models::WebhookRequestBody;
use super::signature::verify_signature;
use crate::error::{CourierError, ErrorCode, Result};

/// Check an inbound request and return its parsed body.
///
/// Both headers must be present before the body is even parsed. The event
/// header must name the same event as the body, and the signature header must
/// verify against `{event, payload}` under `secret`.
pub fn verify_inbound(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
    event_header: &str,
    signature_header: &str,
) -> Result<WebhookRequestBody> {
    let event = header_str(headers, event_header)?;
    let signature = header_str(headers, signature_header)?;

    let parsed: WebhookRequestBody = serde_json::from_slice(body).map_err(|e| {
        CourierError::with_internal(ErrorCode::InvalidJson, "Malformed webhook body", e.to_string())
    })?;

    if parsed.event != event {
        tracing::warn!(
            header_event = %event,
            body_event = %parsed.event,
            "Inbound webhook event mismatch"
        );
        return Err(CourierError::invalid_signature());
    }

    if !verify_signature(signature, &parsed.event, &parsed.payload, secret) {
        tracing::warn!(event = %parsed.event, "Inbound webhook signature rejected");
        return Err(CourierError::invalid_signature());
    }

    Ok(parsed)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CourierError::missing_signature_headers(name))
}
