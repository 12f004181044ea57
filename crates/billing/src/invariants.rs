//! Billing invariants
//!
//! Runnable consistency checks over memberships and payments. Each check is a
//! read-only SQL query; a violation carries enough context to find the rows.
//! Run them after incidents, webhook replays or bulk imports.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub organization_ids: Vec<Uuid>,
    pub description: String,
    /// Row ids and values for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or eligibility is wrong
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipMonthsRow {
    membership_id: Uuid,
    organization_id: Uuid,
    paid_months: i32,
    eligible: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    organization_id: Uuid,
    membership_id: Uuid,
    payment_type: String,
    months_credited: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct OverlapRow {
    membership_id: Uuid,
    organization_id: Uuid,
    subscription_id: Option<String>,
    payment_id: Uuid,
    method: Option<String>,
    period_end: Option<Date>,
}

pub struct InvariantChecker {
    pool: PgPool,
    eligibility_threshold_months: i32,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, eligibility_threshold_months: i32) -> Self {
        Self {
            pool,
            eligibility_threshold_months,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();

        violations.extend(self.check_paid_months_within_threshold().await?);
        violations.extend(self.check_eligibility_matches_paid_months().await?);
        violations.extend(self.check_enrollment_fee_credits_no_months().await?);
        violations.extend(self.check_credited_dues_have_period().await?);
        violations.extend(self.check_completed_payments_have_paid_at().await?);
        violations.extend(self.check_no_manual_dues_under_auto_pay().await?);

        Ok(InvariantCheckSummary::from_violations(
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<InvariantCheckSummary> {
        let violations = match name {
            "paid_months_within_threshold" => self.check_paid_months_within_threshold().await?,
            "eligibility_matches_paid_months" => {
                self.check_eligibility_matches_paid_months().await?
            }
            "enrollment_fee_credits_no_months" => {
                self.check_enrollment_fee_credits_no_months().await?
            }
            "credited_dues_have_period" => self.check_credited_dues_have_period().await?,
            "completed_payments_have_paid_at" => {
                self.check_completed_payments_have_paid_at().await?
            }
            "no_manual_dues_under_auto_pay" => self.check_no_manual_dues_under_auto_pay().await?,
            other => {
                return Err(BillingError::Validation(format!(
                    "unknown invariant check: {}",
                    other
                )))
            }
        };

        Ok(InvariantCheckSummary::from_violations(1, violations))
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_months_within_threshold",
            "eligibility_matches_paid_months",
            "enrollment_fee_credits_no_months",
            "credited_dues_have_period",
            "completed_payments_have_paid_at",
            "no_manual_dues_under_auto_pay",
        ]
    }

    /// Paid months saturate at the eligibility threshold
    async fn check_paid_months_within_threshold(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MembershipMonthsRow> = sqlx::query_as(
            r#"
            SELECT id AS membership_id, organization_id, paid_months, eligible
            FROM memberships
            WHERE paid_months < 0 OR paid_months > $1
            "#,
        )
        .bind(self.eligibility_threshold_months)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_months_within_threshold".to_string(),
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Membership has {} paid months (allowed 0..={})",
                    row.paid_months, self.eligibility_threshold_months
                ),
                context: serde_json::json!({
                    "membership_id": row.membership_id,
                    "paid_months": row.paid_months,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Eligible exactly when the threshold has been reached
    async fn check_eligibility_matches_paid_months(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MembershipMonthsRow> = sqlx::query_as(
            r#"
            SELECT id AS membership_id, organization_id, paid_months, eligible
            FROM memberships
            WHERE eligible <> (paid_months >= $1)
            "#,
        )
        .bind(self.eligibility_threshold_months)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "eligibility_matches_paid_months".to_string(),
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Membership eligible={} with {} paid months (threshold {})",
                    row.eligible, row.paid_months, self.eligibility_threshold_months
                ),
                context: serde_json::json!({
                    "membership_id": row.membership_id,
                    "paid_months": row.paid_months,
                    "eligible": row.eligible,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_enrollment_fee_credits_no_months(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, organization_id, membership_id, payment_type, months_credited
            FROM payments
            WHERE payment_type = 'enrollment_fee' AND months_credited <> 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "enrollment_fee_credits_no_months".to_string(),
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Enrollment fee payment credits {} months",
                    row.months_credited
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "membership_id": row.membership_id,
                    "months_credited": row.months_credited,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Completed dues that credit months carry a period label and invoice
    async fn check_credited_dues_have_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, organization_id, membership_id, payment_type, months_credited
            FROM payments
            WHERE status = 'completed'
              AND payment_type IN ('dues', 'back_dues')
              AND months_credited > 0
              AND (period_label IS NULL OR invoice_number IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credited_dues_have_period".to_string(),
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Completed {} payment credits {} months without period metadata",
                    row.payment_type, row.months_credited
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "membership_id": row.membership_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_completed_payments_have_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id AS payment_id, organization_id, membership_id, payment_type, months_credited
            FROM payments
            WHERE status = 'completed' AND (paid_at IS NULL OR method IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "completed_payments_have_paid_at".to_string(),
                organization_ids: vec![row.organization_id],
                description: "Completed payment is missing paid_at or method".to_string(),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "membership_id": row.membership_id,
                    "payment_type": row.payment_type,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Manual dues covering today on a membership that also bills by
    /// subscription mean the member paid twice for the same period
    async fn check_no_manual_dues_under_auto_pay(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverlapRow> = sqlx::query_as(
            r#"
            SELECT
                m.id AS membership_id,
                m.organization_id,
                m.subscription_id,
                p.id AS payment_id,
                p.method,
                p.period_end
            FROM memberships m
            JOIN payments p ON p.membership_id = m.id
            WHERE m.auto_pay_enabled
              AND m.subscription_status IN ('active', 'trialing', 'past_due')
              AND p.status = 'completed'
              AND p.payment_type IN ('dues', 'back_dues')
              AND p.method IN ('cash', 'check', 'zelle')
              AND p.period_end >= CURRENT_DATE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_manual_dues_under_auto_pay".to_string(),
                organization_ids: vec![row.organization_id],
                description: format!(
                    "Manual {} dues cover the current period while subscription {} is billing",
                    row.method.as_deref().unwrap_or("unknown"),
                    row.subscription_id.as_deref().unwrap_or("unknown")
                ),
                context: serde_json::json!({
                    "membership_id": row.membership_id,
                    "payment_id": row.payment_id,
                    "period_end": row.period_end.map(|d| d.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}
