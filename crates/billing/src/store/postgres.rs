//! Postgres billing store
//!
//! Enum columns are stored as TEXT and parsed on read; an unparseable value
//! surfaces as a database error rather than a silent default.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{
    MembershipStore, OrganizationStore, PaymentStore, WebhookEventOutcome, WebhookEventStore,
    PROCESSING_TIMEOUT_MINUTES,
};
use crate::error::{BillingError, BillingResult};
use crate::fees::FeePolicy;
use crate::models::{
    Membership, MembershipAdvance, NewPayment, OrganizationSettings, Payment, PaymentCompletion,
    SubscriptionUpdate,
};
use crate::pricing::PlanPricing;

const MEMBERSHIP_COLUMNS: &str = r#"
    id, organization_id, member_id, status, billing_frequency, paid_months, eligible,
    next_payment_due, enrollment_fee_status, auto_pay_enabled, subscription_id,
    subscription_status, payer_id, version, created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, organization_id, membership_id, payment_type, status, amount_cents, method,
    months_credited, period_start, period_end, period_label, invoice_number,
    processor_transaction_id, paid_at, recorded_by, failure_reason, notes, created_at
"#;

#[derive(Debug, FromRow)]
struct MembershipRow {
    id: Uuid,
    organization_id: Uuid,
    member_id: Uuid,
    status: String,
    billing_frequency: String,
    paid_months: i32,
    eligible: bool,
    next_payment_due: Option<Date>,
    enrollment_fee_status: String,
    auto_pay_enabled: bool,
    subscription_id: Option<String>,
    subscription_status: String,
    payer_id: Option<Uuid>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = BillingError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            id: row.id,
            organization_id: row.organization_id,
            member_id: row.member_id,
            status: row.status.parse()?,
            billing_frequency: row.billing_frequency.parse()?,
            paid_months: row.paid_months,
            eligible: row.eligible,
            next_payment_due: row.next_payment_due,
            enrollment_fee_status: row.enrollment_fee_status.parse()?,
            auto_pay_enabled: row.auto_pay_enabled,
            subscription_id: row.subscription_id,
            subscription_status: row.subscription_status.parse()?,
            payer_id: row.payer_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    organization_id: Uuid,
    membership_id: Uuid,
    payment_type: String,
    status: String,
    amount_cents: i64,
    method: Option<String>,
    months_credited: i32,
    period_start: Option<Date>,
    period_end: Option<Date>,
    period_label: Option<String>,
    invoice_number: Option<String>,
    processor_transaction_id: Option<String>,
    paid_at: Option<OffsetDateTime>,
    recorded_by: Option<Uuid>,
    failure_reason: Option<String>,
    notes: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            organization_id: row.organization_id,
            membership_id: row.membership_id,
            payment_type: row.payment_type.parse()?,
            status: row.status.parse()?,
            amount_cents: row.amount_cents,
            method: row.method.map(|m| m.parse()).transpose()?,
            months_credited: row.months_credited,
            period_start: row.period_start,
            period_end: row.period_end,
            period_label: row.period_label,
            invoice_number: row.invoice_number,
            processor_transaction_id: row.processor_transaction_id,
            paid_at: row.paid_at,
            recorded_by: row.recorded_by,
            failure_reason: row.failure_reason,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    invoice_prefix: String,
    platform_fee_cents: i64,
    pass_fees_to_member: bool,
    monthly_dues_cents: i64,
    biannual_dues_cents: Option<i64>,
    annual_dues_cents: Option<i64>,
    enrollment_fee_cents: i64,
}

impl TryFrom<OrganizationRow> for OrganizationSettings {
    type Error = BillingError;

    fn try_from(row: OrganizationRow) -> Result<Self, Self::Error> {
        Ok(OrganizationSettings {
            organization_id: row.id,
            name: row.name,
            invoice_prefix: row.invoice_prefix,
            fee_policy: FeePolicy::new(row.platform_fee_cents, row.pass_fees_to_member)?,
            pricing: PlanPricing {
                monthly_cents: row.monthly_dues_cents,
                biannual_cents: row.biannual_dues_cents,
                annual_cents: row.annual_dues_cents,
            },
            enrollment_fee_cents: row.enrollment_fee_cents,
        })
    }
}

/// Billing store backed by the shared Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PaymentStore for PgStore {
    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> =
            sqlx::query_as(&format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS))
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_transaction_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE processor_transaction_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(processor_transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<Payment> {
        let row: PaymentRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO payments (
                organization_id, membership_id, payment_type, status, amount_cents,
                months_credited, period_start, period_end, period_label, invoice_number,
                processor_transaction_id, recorded_by, notes
            )
            VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment.organization_id)
        .bind(payment.membership_id)
        .bind(payment.payment_type.as_str())
        .bind(payment.amount_cents)
        .bind(payment.months_credited)
        .bind(payment.period_start)
        .bind(payment.period_end)
        .bind(&payment.period_label)
        .bind(&payment.invoice_number)
        .bind(&payment.processor_transaction_id)
        .bind(payment.recorded_by)
        .bind(&payment.notes)
        .fetch_one(&self.pool)
        .await?;

        Payment::try_from(row)
    }

    async fn complete_payment_if_pending(
        &self,
        payment_id: Uuid,
        completion: &PaymentCompletion,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET
                status = 'completed',
                method = $2,
                paid_at = $3,
                processor_transaction_id = COALESCE($4, processor_transaction_id),
                recorded_by = COALESCE($5, recorded_by)
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(completion.method.as_str())
        .bind(completion.paid_at)
        .bind(&completion.processor_transaction_id)
        .bind(completion.recorded_by)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn revert_payment_to_pending(&self, previous: &Payment) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                status = 'pending',
                method = $2,
                paid_at = $3,
                processor_transaction_id = $4,
                recorded_by = $5
            WHERE id = $1 AND status = 'completed'
            "#,
        )
        .bind(previous.id)
        .bind(previous.method.map(|m| m.as_str()))
        .bind(previous.paid_at)
        .bind(&previous.processor_transaction_id)
        .bind(previous.recorded_by)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_payment_if_pending(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET status = 'failed', failure_reason = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn list_payments_for_membership(&self, membership_id: Uuid) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE membership_id = $1 ORDER BY created_at",
            PAYMENT_COLUMNS
        ))
        .bind(membership_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Payment::try_from).collect()
    }
}

#[async_trait]
impl MembershipStore for PgStore {
    async fn get_membership(&self, membership_id: Uuid) -> BillingResult<Option<Membership>> {
        let row: Option<MembershipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM memberships WHERE id = $1",
            MEMBERSHIP_COLUMNS
        ))
        .bind(membership_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Membership::try_from).transpose()
    }

    async fn find_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Membership>> {
        let row: Option<MembershipRow> = sqlx::query_as(&format!(
            "SELECT {} FROM memberships WHERE subscription_id = $1",
            MEMBERSHIP_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Membership::try_from).transpose()
    }

    async fn advance_membership_if_version(
        &self,
        membership_id: Uuid,
        expected_version: i64,
        advance: &MembershipAdvance,
    ) -> BillingResult<Option<Membership>> {
        let row: Option<MembershipRow> = sqlx::query_as(&format!(
            r#"
            UPDATE memberships SET
                status = $3,
                paid_months = $4,
                eligible = $5,
                next_payment_due = $6,
                enrollment_fee_status = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            MEMBERSHIP_COLUMNS
        ))
        .bind(membership_id)
        .bind(expected_version)
        .bind(advance.status.as_str())
        .bind(advance.paid_months)
        .bind(advance.eligible)
        .bind(advance.next_payment_due)
        .bind(advance.enrollment_fee_status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Membership::try_from).transpose()
    }

    async fn update_subscription(
        &self,
        membership_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Membership> {
        let row: Option<MembershipRow> = sqlx::query_as(&format!(
            r#"
            UPDATE memberships SET
                subscription_id = $2,
                subscription_status = $3,
                auto_pay_enabled = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MEMBERSHIP_COLUMNS
        ))
        .bind(membership_id)
        .bind(&update.subscription_id)
        .bind(update.status.as_str())
        .bind(update.auto_pay_enabled)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(BillingError::MembershipNotFound(membership_id))
            .and_then(Membership::try_from)
    }
}

#[async_trait]
impl OrganizationStore for PgStore {
    async fn get_organization_settings(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<OrganizationSettings>> {
        let row: Option<OrganizationRow> = sqlx::query_as(
            r#"
            SELECT id, name, invoice_prefix, platform_fee_cents, pass_fees_to_member,
                   monthly_dues_cents, biannual_dues_cents, annual_dues_cents,
                   enrollment_fee_cents
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrganizationSettings::try_from).transpose()
    }

    async fn next_invoice_sequence(&self, organization_id: Uuid) -> BillingResult<i64> {
        let sequence: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE organizations SET invoice_sequence = invoice_sequence + 1
            WHERE id = $1
            RETURNING invoice_sequence
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        sequence.ok_or(BillingError::OrganizationNotFound(organization_id))
    }
}

#[async_trait]
impl WebhookEventStore for PgStore {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        // Claim the event; errored events and claims stuck in processing
        // past the timeout may be re-claimed
        let result = sqlx::query(
            r#"
            INSERT INTO processor_webhook_events
                (event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CASE
                    WHEN processor_webhook_events.processing_result = 'processing'
                        THEN CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                    ELSE NULL
                END,
                received_at = NOW()
            WHERE processor_webhook_events.processing_result = 'error'
               OR (processor_webhook_events.processing_result = 'processing'
                   AND processor_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: WebhookEventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processor_webhook_events
            SET processing_result = $2, error_message = $3, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
