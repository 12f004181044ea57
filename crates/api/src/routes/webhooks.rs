//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use duesledger_billing::{webhooks::verify_event, BillingStore, WebhookEvent};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify, parse and reconcile one delivery. Errors return a non-2xx status
/// so Stripe redelivers; the event stays claimable after a failed attempt.
pub async fn stripe_webhook<S>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)>
where
    S: BillingStore + 'static,
{
    let secret = state
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::ServiceUnavailable("webhooks are not configured".into()))?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("missing Stripe-Signature header".into()))?;

    let event = WebhookEvent::from_stripe(verify_event(&body, signature, secret)?);
    tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Webhook verified");

    let outcome = state.billing.webhooks.handle_event(&event).await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "received": true,
            "outcome": outcome,
        })),
    ))
}
