//! Billing records: memberships, payments and organization settings

use duesledger_shared::{
    BillingFrequency, EnrollmentFeeStatus, MembershipStatus, PaymentMethod, PaymentStatus,
    PaymentType, SubscriptionStatus,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::fees::FeePolicy;
use crate::pricing::PlanPricing;

/// Default number of paid months after which a member becomes eligible
pub const DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS: i32 = 60;

/// One member's standing with one organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub member_id: Uuid,
    pub status: MembershipStatus,
    pub billing_frequency: BillingFrequency,
    pub paid_months: i32,
    pub eligible: bool,
    pub next_payment_due: Option<Date>,
    pub enrollment_fee_status: EnrollmentFeeStatus,
    pub auto_pay_enabled: bool,
    pub subscription_id: Option<String>,
    pub subscription_status: SubscriptionStatus,
    /// Third party paying on this member's behalf
    pub payer_id: Option<Uuid>,
    /// Bumped on every update; writes are conditional on it
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Membership {
    /// A new pending membership, as created at signup
    pub fn new(organization_id: Uuid, member_id: Uuid, billing_frequency: BillingFrequency) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            member_id,
            status: MembershipStatus::Pending,
            billing_frequency,
            paid_months: 0,
            eligible: false,
            next_payment_due: None,
            enrollment_fee_status: EnrollmentFeeStatus::Unpaid,
            auto_pay_enabled: false,
            subscription_id: None,
            subscription_status: SubscriptionStatus::None,
            payer_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recurring billing is live and would collect dues on its own
    pub fn has_active_recurring_billing(&self) -> bool {
        self.auto_pay_enabled && self.subscription_status.is_billing()
    }
}

/// Fields the settlement engine writes back to a membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipAdvance {
    pub status: MembershipStatus,
    pub paid_months: i32,
    pub eligible: bool,
    pub next_payment_due: Option<Date>,
    pub enrollment_fee_status: EnrollmentFeeStatus,
}

/// Subscription state pushed by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub auto_pay_enabled: bool,
}

/// One billing event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub membership_id: Uuid,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    /// Base amount in cents, before processing fees
    pub amount_cents: i64,
    pub method: Option<PaymentMethod>,
    pub months_credited: i32,
    pub period_start: Option<Date>,
    pub period_end: Option<Date>,
    pub period_label: Option<String>,
    pub invoice_number: Option<String>,
    pub processor_transaction_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub recorded_by: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Payment {
    /// Months this payment credits once settled
    pub fn effective_months(&self) -> i32 {
        if self.payment_type.credits_months() {
            self.months_credited.max(0)
        } else {
            0
        }
    }
}

/// A pending payment row to insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub organization_id: Uuid,
    pub membership_id: Uuid,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    pub months_credited: i32,
    pub period_start: Option<Date>,
    pub period_end: Option<Date>,
    pub period_label: Option<String>,
    pub invoice_number: Option<String>,
    pub processor_transaction_id: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub notes: Option<String>,
}

impl NewPayment {
    pub fn into_payment(self, id: Uuid, created_at: OffsetDateTime) -> Payment {
        Payment {
            id,
            organization_id: self.organization_id,
            membership_id: self.membership_id,
            payment_type: self.payment_type,
            status: PaymentStatus::Pending,
            amount_cents: self.amount_cents,
            method: None,
            months_credited: self.months_credited,
            period_start: self.period_start,
            period_end: self.period_end,
            period_label: self.period_label,
            invoice_number: self.invoice_number,
            processor_transaction_id: self.processor_transaction_id,
            paid_at: None,
            recorded_by: self.recorded_by,
            failure_reason: None,
            notes: self.notes,
            created_at,
        }
    }
}

/// Settlement facts stamped on a completed payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCompletion {
    pub method: PaymentMethod,
    pub paid_at: OffsetDateTime,
    pub processor_transaction_id: Option<String>,
    pub recorded_by: Option<Uuid>,
}

/// Per-organization billing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationSettings {
    pub organization_id: Uuid,
    pub name: String,
    pub invoice_prefix: String,
    pub fee_policy: FeePolicy,
    pub pricing: PlanPricing,
    pub enrollment_fee_cents: i64,
}
