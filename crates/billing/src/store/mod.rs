//! Storage seams for billing data
//!
//! The settlement engine only talks to these traits. Every mutating method is
//! a conditional write so that two request-scoped settlements racing on the
//! same payment or membership cannot both apply:
//!
//! - payments move out of `pending` only `WHERE status = 'pending'`
//! - memberships update only `WHERE version = expected_version`
//!
//! Two implementations are provided: [`memory::InMemoryStore`] for tests and
//! embedding, and [`postgres::PgStore`] for production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    Membership, MembershipAdvance, NewPayment, OrganizationSettings, Payment, PaymentCompletion,
    SubscriptionUpdate,
};

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>>;

    async fn find_payment_by_transaction_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Payment>>;

    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<Payment>;

    /// Mark a pending payment completed. Returns `None` when the payment was
    /// not pending (already settled, failed, or missing).
    async fn complete_payment_if_pending(
        &self,
        payment_id: Uuid,
        completion: &PaymentCompletion,
    ) -> BillingResult<Option<Payment>>;

    /// Undo [`PaymentStore::complete_payment_if_pending`] after the membership
    /// write failed, restoring the completion fields from `previous` (the row
    /// as read before completion). Returns whether a completed row was
    /// reverted.
    async fn revert_payment_to_pending(&self, previous: &Payment) -> BillingResult<bool>;

    /// Mark a pending payment failed. Returns `None` when it was not pending.
    async fn fail_payment_if_pending(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> BillingResult<Option<Payment>>;

    async fn list_payments_for_membership(&self, membership_id: Uuid) -> BillingResult<Vec<Payment>>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_membership(&self, membership_id: Uuid) -> BillingResult<Option<Membership>>;

    async fn find_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Membership>>;

    /// Apply a settlement advance if the row is still at `expected_version`.
    /// Returns the updated membership, or `None` on version mismatch.
    async fn advance_membership_if_version(
        &self,
        membership_id: Uuid,
        expected_version: i64,
        advance: &MembershipAdvance,
    ) -> BillingResult<Option<Membership>>;

    async fn update_subscription(
        &self,
        membership_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Membership>;
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    async fn get_organization_settings(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<OrganizationSettings>>;

    /// Atomically increment and return the organization's invoice counter
    async fn next_invoice_sequence(&self, organization_id: Uuid) -> BillingResult<i64>;
}

/// A claim still in processing after this long is treated as abandoned by a
/// crashed worker and may be taken over by a redelivery
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Processing state of a received webhook event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventOutcome {
    Success,
    Error,
}

impl WebhookEventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventOutcome::Success => "success",
            WebhookEventOutcome::Error => "error",
        }
    }
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Claim exclusive processing of an event. Returns `false` when the event
    /// was already processed successfully or is being processed elsewhere.
    /// Events that previously errored, or whose claim has been in processing
    /// longer than [`PROCESSING_TIMEOUT_MINUTES`], may be claimed again.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: WebhookEventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

/// Everything the billing engine needs from persistence
pub trait BillingStore:
    PaymentStore + MembershipStore + OrganizationStore + WebhookEventStore
{
}

impl<T> BillingStore for T where
    T: PaymentStore + MembershipStore + OrganizationStore + WebhookEventStore
{
}
