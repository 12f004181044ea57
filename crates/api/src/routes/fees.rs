//! Fee preview

use axum::{extract::State, Json};
use duesledger_billing::{
    store::OrganizationStore, BillingStore, FeeBreakdown, FeeBreakdownDollars, FeePolicy,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Either an organization whose fee settings apply, or explicit settings.
/// Explicit fields override the organization's.
#[derive(Debug, Deserialize)]
pub struct FeePreviewRequest {
    pub base_amount_cents: i64,
    pub organization_id: Option<Uuid>,
    pub platform_fee_dollars: Option<f64>,
    pub pass_fees_to_member: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeePreviewResponse {
    #[serde(flatten)]
    pub breakdown: FeeBreakdown,
    pub dollars: FeeBreakdownDollars,
}

pub async fn preview_fees<S>(
    State(state): State<AppState<S>>,
    Json(req): Json<FeePreviewRequest>,
) -> ApiResult<Json<FeePreviewResponse>>
where
    S: BillingStore + 'static,
{
    let base_policy = match req.organization_id {
        Some(org_id) => {
            state
                .billing
                .store()
                .get_organization_settings(org_id)
                .await?
                .ok_or(ApiError::NotFound)?
                .fee_policy
        }
        None => FeePolicy::default(),
    };

    let policy = match req.platform_fee_dollars {
        Some(dollars) => FeePolicy::from_dollars(
            dollars,
            req.pass_fees_to_member
                .unwrap_or(base_policy.pass_fees_to_member),
        )?,
        None => FeePolicy {
            pass_fees_to_member: req
                .pass_fees_to_member
                .unwrap_or(base_policy.pass_fees_to_member),
            ..base_policy
        },
    };

    let breakdown = policy.calculate(req.base_amount_cents)?;

    Ok(Json(FeePreviewResponse {
        dollars: breakdown.dollars(),
        breakdown,
    }))
}
