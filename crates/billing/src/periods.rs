//! Billing periods and invoice numbers
//!
//! Every dues or back-dues payment that credits months gets a period
//! (start, end, human label) and an invoice number that is sequential per
//! organization.

use std::sync::Arc;

use async_trait::async_trait;
use duesledger_shared::BillingFrequency;
use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::OrganizationStore;

/// Input to the period generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodRequest {
    pub organization_id: Uuid,
    /// First day covered by the payment
    pub anchor: Date,
    pub frequency: BillingFrequency,
    /// Explicit month count (back dues); defaults to one billing period
    pub months: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodMetadata {
    pub period_start: Date,
    pub period_end: Date,
    pub period_label: String,
    pub invoice_number: String,
    pub months_credited: i32,
}

#[async_trait]
pub trait PeriodGenerator: Send + Sync {
    async fn generate(&self, request: &PeriodRequest) -> BillingResult<PeriodMetadata>;
}

/// Calendar-month periods with `{PREFIX}-{YEAR}-{SEQ}` invoice numbers
pub struct CalendarPeriodGenerator<S> {
    store: Arc<S>,
}

impl<S> CalendarPeriodGenerator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> PeriodGenerator for CalendarPeriodGenerator<S>
where
    S: OrganizationStore + 'static,
{
    async fn generate(&self, request: &PeriodRequest) -> BillingResult<PeriodMetadata> {
        let months = request.months.unwrap_or_else(|| request.frequency.months());
        if months == 0 {
            return Err(BillingError::Validation(
                "a billing period must cover at least one month".to_string(),
            ));
        }

        let settings = self
            .store
            .get_organization_settings(request.organization_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound(request.organization_id))?;

        let (period_start, period_end) = period_bounds(request.anchor, months)?;
        let sequence = self
            .store
            .next_invoice_sequence(request.organization_id)
            .await?;

        Ok(PeriodMetadata {
            period_start,
            period_end,
            period_label: period_label(period_start, period_end),
            invoice_number: format_invoice_number(&settings.invoice_prefix, period_start.year(), sequence),
            months_credited: i32::try_from(months)
                .map_err(|_| BillingError::Validation(format!("too many months: {}", months)))?,
        })
    }
}

/// Add calendar months, clamping the day to the end of the target month
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(date: Date, months: u32) -> BillingResult<Date> {
    let months = i32::try_from(months)
        .map_err(|_| BillingError::Validation(format!("too many months: {}", months)))?;
    let zero_based = (date.year() * 12 + (date.month() as i32 - 1))
        .checked_add(months)
        .ok_or_else(|| BillingError::Validation(format!("too many months: {}", months)))?;
    let year = zero_based.div_euclid(12);
    let month = Month::try_from((zero_based.rem_euclid(12) + 1) as u8)
        .map_err(|e| BillingError::Validation(format!("invalid month: {}", e)))?;
    let day = date.day().min(time::util::days_in_year_month(year, month));

    Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::Validation(format!("date out of range: {}", e)))
}

/// First and last day of a period of `months` starting at `start`
pub fn period_bounds(start: Date, months: u32) -> BillingResult<(Date, Date)> {
    let next = add_months(start, months)?;
    let end = next
        .checked_sub(Duration::days(1))
        .ok_or_else(|| BillingError::Validation("date out of range".to_string()))?;
    Ok((start, end))
}

/// "March 2025" or "March 2025 - August 2025"
pub fn period_label(start: Date, end: Date) -> String {
    if start.year() == end.year() && start.month() == end.month() {
        format!("{} {}", start.month(), start.year())
    } else {
        format!(
            "{} {} - {} {}",
            start.month(),
            start.year(),
            end.month(),
            end.year()
        )
    }
}

pub fn format_invoice_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:05}", prefix.trim().to_uppercase(), year, sequence)
}
