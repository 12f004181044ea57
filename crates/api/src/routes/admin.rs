//! Operator consistency checks

use axum::{
    extract::{Query, State},
    Json,
};
use duesledger_billing::{BillingStore, InvariantCheckSummary};
use serde::Deserialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct InvariantsQuery {
    /// Run a single named check instead of all of them
    pub check: Option<String>,
}

pub async fn run_invariants<S>(
    State(state): State<AppState<S>>,
    Query(query): Query<InvariantsQuery>,
) -> ApiResult<Json<InvariantCheckSummary>>
where
    S: BillingStore + 'static,
{
    let checker = state
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::ServiceUnavailable("invariant checks need a database".into()))?;

    let summary = match query.check.as_deref() {
        Some(name) => checker.run_check(name).await?,
        None => checker.run_all_checks().await?,
    };

    Ok(Json(summary))
}
