//! Payment recording, card charges and manual settlement

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use duesledger_billing::{
    notifications::{self, Notification},
    processor::payment_metadata,
    store::{OrganizationStore, PaymentStore},
    AmountVariance, BillingError, BillingStore, CreatedPaymentIntent, FeeBreakdown, Payment,
    PaymentIntentRequest, RecordPayment, SettlementOutcome, SettlementRequest,
};
use duesledger_shared::{PaymentMethod, PaymentStatus, PaymentType};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    pub months: Option<u32>,
    pub method: PaymentMethod,
    /// Defaults to now
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub processor_transaction_id: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub subscription_id: Option<String>,
    pub period_start: Option<Date>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordPaymentResponse {
    pub payment: Payment,
    pub settlement: SettlementOutcome,
    pub variance: Option<AmountVariance>,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRequest {
    #[serde(default = "default_charge_type")]
    pub payment_type: PaymentType,
    /// Base amount the organization should receive
    pub amount_cents: i64,
    pub months: Option<u32>,
    pub customer_id: Option<String>,
    pub description: Option<String>,
    pub recorded_by: Option<Uuid>,
}

fn default_charge_type() -> PaymentType {
    PaymentType::Dues
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChargeResponse {
    pub payment: Payment,
    pub fees: FeeBreakdown,
    pub payment_intent: CreatedPaymentIntent,
    pub variance: AmountVariance,
}

#[derive(Debug, Deserialize)]
pub struct SettlePaymentRequest {
    pub method: PaymentMethod,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub processor_transaction_id: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SettlePaymentResponse {
    pub payment: Payment,
    pub settlement: SettlementOutcome,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
pub struct FailPaymentRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailPaymentResponse {
    pub payment: Payment,
    pub notifications: Vec<Notification>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Surface notifications a failed request still calls for
fn log_error_notifications(err: &BillingError) {
    let pending = notifications::for_error(err);
    if !pending.is_empty() {
        tracing::info!(notifications = ?pending, "Notifications pending for rejected payment");
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Record a payment against a membership and settle it in one step
pub async fn record_payment<S>(
    State(state): State<AppState<S>>,
    Path(membership_id): Path<Uuid>,
    Json(req): Json<RecordPaymentRequest>,
) -> ApiResult<(StatusCode, Json<RecordPaymentResponse>)>
where
    S: BillingStore + 'static,
{
    let record = RecordPayment {
        membership_id,
        payment_type: req.payment_type,
        amount_cents: req.amount_cents,
        months: req.months,
        method: req.method,
        paid_at: req.paid_at.unwrap_or_else(OffsetDateTime::now_utc),
        processor_transaction_id: req.processor_transaction_id,
        recorded_by: req.recorded_by,
        subscription_id: req.subscription_id,
        period_start: req.period_start,
        notes: req.notes,
    };

    let recorded = state
        .billing
        .settlement
        .record_and_settle(record)
        .await
        .inspect_err(log_error_notifications)?;

    let notifications = notifications::for_settlement(&recorded.payment, &recorded.settlement);

    tracing::info!(
        payment_id = %recorded.payment.id,
        membership_id = %membership_id,
        already_settled = recorded.settlement.already_settled,
        paid_months = recorded.settlement.paid_months,
        "Payment recorded"
    );

    Ok((
        StatusCode::CREATED,
        Json(RecordPaymentResponse {
            payment: recorded.payment,
            settlement: recorded.settlement,
            variance: recorded.variance,
            notifications,
        }),
    ))
}

/// Size a card charge, create the pending payment and its payment intent.
/// The payment settles when the processor reports success.
pub async fn create_charge<S>(
    State(state): State<AppState<S>>,
    Path(membership_id): Path<Uuid>,
    Json(req): Json<ChargeRequest>,
) -> ApiResult<(StatusCode, Json<ChargeResponse>)>
where
    S: BillingStore + 'static,
{
    let processor = state
        .processor
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("card processing is not configured".into()))?;

    let engine = &state.billing.settlement;
    let record = RecordPayment {
        membership_id,
        payment_type: req.payment_type,
        amount_cents: req.amount_cents,
        months: req.months,
        method: PaymentMethod::Stripe,
        paid_at: OffsetDateTime::now_utc(),
        processor_transaction_id: None,
        recorded_by: req.recorded_by,
        subscription_id: None,
        period_start: None,
        notes: req.description.clone(),
    };

    let (payment, variance) = engine
        .create_pending_payment(&record)
        .await
        .inspect_err(log_error_notifications)?;

    let settings = engine
        .store()
        .get_organization_settings(payment.organization_id)
        .await?
        .ok_or(BillingError::OrganizationNotFound(payment.organization_id))?;
    let fees = settings.fee_policy.calculate(payment.amount_cents)?;

    let intent_request = PaymentIntentRequest {
        amount_cents: fees.charge_amount_cents,
        application_fee_cents: fees.application_fee_cents,
        customer_id: req.customer_id,
        description: req.description.or_else(|| {
            payment
                .period_label
                .as_ref()
                .map(|label| format!("{} dues: {}", settings.name, label))
        }),
        metadata: payment_metadata(&payment),
    };

    let payment_intent = match processor.create_payment_intent(&intent_request).await {
        Ok(intent) => intent,
        Err(e) => {
            tracing::error!(payment_id = %payment.id, error = %e, "Payment intent creation failed");
            if let Err(fail_err) = engine
                .fail_payment(payment.id, "payment intent creation failed")
                .await
            {
                tracing::error!(
                    payment_id = %payment.id,
                    error = %fail_err,
                    "Failed to mark orphaned pending payment as failed"
                );
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        payment_id = %payment.id,
        payment_intent_id = %payment_intent.id,
        charge_amount_cents = fees.charge_amount_cents,
        "Card charge created"
    );

    Ok((
        StatusCode::CREATED,
        Json(ChargeResponse {
            payment,
            fees,
            payment_intent,
            variance,
        }),
    ))
}

/// Settle an existing pending payment
pub async fn settle_payment<S>(
    State(state): State<AppState<S>>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<SettlePaymentRequest>,
) -> ApiResult<Json<SettlePaymentResponse>>
where
    S: BillingStore + 'static,
{
    let engine = &state.billing.settlement;
    let settlement = engine
        .settle_payment(SettlementRequest {
            payment_id,
            method: req.method,
            paid_at: req.paid_at.unwrap_or_else(OffsetDateTime::now_utc),
            processor_transaction_id: req.processor_transaction_id,
            recorded_by: req.recorded_by,
            subscription_id: req.subscription_id,
        })
        .await
        .inspect_err(log_error_notifications)?;

    let payment = engine
        .store()
        .get_payment(payment_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let notifications = notifications::for_settlement(&payment, &settlement);

    Ok(Json(SettlePaymentResponse {
        payment,
        settlement,
        notifications,
    }))
}

/// Mark a pending payment failed. Failing an already failed payment is a no-op.
pub async fn fail_payment<S>(
    State(state): State<AppState<S>>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<FailPaymentRequest>,
) -> ApiResult<Json<FailPaymentResponse>>
where
    S: BillingStore + 'static,
{
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::Validation("reason must not be empty".into()));
    }

    let engine = &state.billing.settlement;
    let was_failed = engine
        .store()
        .get_payment(payment_id)
        .await?
        .is_some_and(|p| p.status == PaymentStatus::Failed);

    let payment = engine.fail_payment(payment_id, reason).await?;
    let notifications = if was_failed {
        Vec::new()
    } else {
        notifications::for_failed_payment(&payment)
    };

    Ok(Json(FailPaymentResponse {
        payment,
        notifications,
    }))
}
