// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::Stripe wraps the full StripeError
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DuesLedger Billing Module
//!
//! Fee calculation and payment settlement for recurring membership dues.
//!
//! ## Features
//!
//! - **Fees**: Size card charges in standard or gross-up mode, and recover the
//!   base amount from a charged amount
//! - **Settlement**: Apply payments to memberships exactly once (paid months,
//!   eligibility, next due date, enrollment fee)
//! - **Conflict Guard**: Refuse manual dues while a subscription bills the member
//! - **Periods**: Billing period labels and per-organization invoice numbers
//! - **Webhooks**: Reconcile Stripe payment and subscription events
//! - **Invariants**: SQL consistency checks for operators

pub mod client;
pub mod error;
pub mod fees;
pub mod invariants;
pub mod models;
pub mod notifications;
pub mod periods;
pub mod pricing;
pub mod processor;
pub mod settlement;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Fees
pub use fees::{
    calculate_fees, calculate_fees_cents, reverse_calculate_base_amount,
    reverse_calculate_base_amount_cents, FeeBreakdown, FeeBreakdownDollars, FeePolicy,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    Membership, MembershipAdvance, NewPayment, OrganizationSettings, Payment, PaymentCompletion,
    SubscriptionUpdate, DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS,
};

// Notifications
pub use notifications::Notification;

// Periods
pub use periods::{CalendarPeriodGenerator, PeriodGenerator, PeriodMetadata, PeriodRequest};

// Pricing
pub use pricing::{check_amount_variance, AmountVariance, PlanPricing};

// Processor
pub use processor::{
    CreatedPaymentIntent, CustomerRequest, PaymentIntentRequest, PaymentProcessor,
    ProcessorSubscription, SubscriptionRequest,
};

// Settlement
pub use settlement::{
    MembershipLocks, RecordPayment, RecordedSettlement, SettlementEngine, SettlementOutcome,
    SettlementRequest, MAX_MONTHS_PER_PAYMENT,
};

// Store
pub use store::memory::InMemoryStore;
pub use store::postgres::PgStore;
pub use store::BillingStore;

// Webhooks
pub use webhooks::{ProcessorEvent, WebhookEvent, WebhookOutcome, WebhookReconciler};

use sqlx::PgPool;

/// Main billing service that combines settlement and webhook reconciliation
/// over one store
pub struct BillingService<S> {
    pub settlement: Arc<SettlementEngine<S>>,
    pub webhooks: WebhookReconciler<S>,
}

impl<S> BillingService<S>
where
    S: BillingStore + 'static,
{
    pub fn new(store: Arc<S>, eligibility_threshold_months: i32) -> Self {
        let settlement = Arc::new(
            SettlementEngine::new(store).with_eligibility_threshold(eligibility_threshold_months),
        );

        Self {
            webhooks: WebhookReconciler::new(settlement.clone()),
            settlement,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.settlement.store()
    }
}

impl BillingService<PgStore> {
    /// Create a billing service backed by Postgres
    pub fn postgres(pool: PgPool, eligibility_threshold_months: i32) -> Self {
        Self::new(Arc::new(PgStore::new(pool)), eligibility_threshold_months)
    }
}
