//! HTTP routes

mod admin;
mod fees;
mod payments;
mod webhooks;


use axum::{
    routing::{get, post},
    Json, Router,
};
use duesledger_billing::BillingStore;
use serde_json::{json, Value};

use crate::state::AppState;

pub use fees::{FeePreviewRequest, FeePreviewResponse};
pub use payments::{
    ChargeRequest, ChargeResponse, FailPaymentRequest, FailPaymentResponse, RecordPaymentRequest,
    RecordPaymentResponse, SettlePaymentRequest, SettlePaymentResponse,
};

pub fn create_router<S>(state: AppState<S>) -> Router
where
    S: BillingStore + 'static,
{
    let api = Router::new()
        .route("/fees/preview", post(fees::preview_fees::<S>))
        .route(
            "/memberships/{membership_id}/payments",
            post(payments::record_payment::<S>),
        )
        .route(
            "/memberships/{membership_id}/charges",
            post(payments::create_charge::<S>),
        )
        .route(
            "/payments/{payment_id}/settle",
            post(payments::settle_payment::<S>),
        )
        .route("/payments/{payment_id}/fail", post(payments::fail_payment::<S>))
        .route("/admin/invariants", get(admin::run_invariants::<S>));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook::<S>))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
