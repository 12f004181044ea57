//! In-memory billing store
//!
//! Honors the same conditional-write contract as the Postgres store. Used by
//! the test suites and by embedders that don't need durability. Failure
//! injection hooks let tests exercise the settlement rollback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use duesledger_shared::PaymentStatus;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
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

#[derive(Debug, Clone)]
struct OrganizationRecord {
    settings: OrganizationSettings,
    invoice_sequence: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Processing { started_at: OffsetDateTime },
    Done(WebhookEventOutcome),
}

#[derive(Debug, Default)]
struct Inner {
    organizations: HashMap<Uuid, OrganizationRecord>,
    memberships: HashMap<Uuid, Membership>,
    payments: HashMap<Uuid, Payment>,
    webhook_events: HashMap<String, EventState>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    failing_membership_writes: AtomicU32,
    fail_payment_reverts: AtomicBool,
    processing_timeout: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            inner: RwLock::default(),
            failing_membership_writes: AtomicU32::new(0),
            fail_payment_reverts: AtomicBool::new(false),
            processing_timeout: Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a webhook claim may stay in processing before another
    /// delivery can take it over
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub async fn insert_organization(&self, settings: OrganizationSettings) {
        let mut inner = self.inner.write().await;
        inner.organizations.insert(
            settings.organization_id,
            OrganizationRecord {
                settings,
                invoice_sequence: 0,
            },
        );
    }

    /// Add an organization with default fee settings and $25/month dues
    pub async fn seed_organization(&self, name: &str, invoice_prefix: &str) -> Uuid {
        let organization_id = Uuid::new_v4();
        self.insert_organization(OrganizationSettings {
            organization_id,
            name: name.to_string(),
            invoice_prefix: invoice_prefix.to_string(),
            fee_policy: FeePolicy::default(),
            pricing: PlanPricing {
                monthly_cents: 2_500,
                biannual_cents: None,
                annual_cents: None,
            },
            enrollment_fee_cents: 5_000,
        })
        .await;
        organization_id
    }

    pub async fn insert_membership(&self, membership: Membership) {
        let mut inner = self.inner.write().await;
        inner.memberships.insert(membership.id, membership);
    }

    /// Make the next `count` membership writes fail with a database error
    pub fn fail_membership_writes(&self, count: u32) {
        self.failing_membership_writes.store(count, Ordering::SeqCst);
    }

    /// Make payment reverts fail, leaving a completed payment behind
    pub fn fail_payment_reverts(&self, fail: bool) {
        self.fail_payment_reverts.store(fail, Ordering::SeqCst);
    }

    fn take_membership_write_failure(&self) -> bool {
        self.failing_membership_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn get_payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.inner.read().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_transaction_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.processor_transaction_id.as_deref() == Some(processor_transaction_id))
            .cloned())
    }

    async fn insert_payment(&self, payment: NewPayment) -> BillingResult<Payment> {
        let mut inner = self.inner.write().await;

        if let Some(txn) = payment.processor_transaction_id.as_deref() {
            if inner
                .payments
                .values()
                .any(|p| p.processor_transaction_id.as_deref() == Some(txn))
            {
                return Err(BillingError::Database(format!(
                    "duplicate processor transaction id: {}",
                    txn
                )));
            }
        }

        let payment = payment.into_payment(Uuid::new_v4(), OffsetDateTime::now_utc());
        inner.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn complete_payment_if_pending(
        &self,
        payment_id: Uuid,
        completion: &PaymentCompletion,
    ) -> BillingResult<Option<Payment>> {
        let mut inner = self.inner.write().await;
        let Some(payment) = inner.payments.get_mut(&payment_id) else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        payment.status = PaymentStatus::Completed;
        payment.method = Some(completion.method);
        payment.paid_at = Some(completion.paid_at);
        if completion.processor_transaction_id.is_some() {
            payment.processor_transaction_id = completion.processor_transaction_id.clone();
        }
        if completion.recorded_by.is_some() {
            payment.recorded_by = completion.recorded_by;
        }
        Ok(Some(payment.clone()))
    }

    async fn revert_payment_to_pending(&self, previous: &Payment) -> BillingResult<bool> {
        if self.fail_payment_reverts.load(Ordering::SeqCst) {
            return Err(BillingError::Database("injected revert failure".to_string()));
        }

        let mut inner = self.inner.write().await;
        let Some(payment) = inner.payments.get_mut(&previous.id) else {
            return Ok(false);
        };
        if payment.status != PaymentStatus::Completed {
            return Ok(false);
        }

        payment.status = PaymentStatus::Pending;
        payment.method = previous.method;
        payment.paid_at = previous.paid_at;
        payment.processor_transaction_id = previous.processor_transaction_id.clone();
        payment.recorded_by = previous.recorded_by;
        Ok(true)
    }

    async fn fail_payment_if_pending(
        &self,
        payment_id: Uuid,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        let mut inner = self.inner.write().await;
        let Some(payment) = inner.payments.get_mut(&payment_id) else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.to_string());
        Ok(Some(payment.clone()))
    }

    async fn list_payments_for_membership(&self, membership_id: Uuid) -> BillingResult<Vec<Payment>> {
        let inner = self.inner.read().await;
        let mut payments: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| p.membership_id == membership_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn get_membership(&self, membership_id: Uuid) -> BillingResult<Option<Membership>> {
        Ok(self.inner.read().await.memberships.get(&membership_id).cloned())
    }

    async fn find_membership_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Membership>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memberships
            .values()
            .find(|m| m.subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn advance_membership_if_version(
        &self,
        membership_id: Uuid,
        expected_version: i64,
        advance: &MembershipAdvance,
    ) -> BillingResult<Option<Membership>> {
        if self.take_membership_write_failure() {
            return Err(BillingError::Database("injected membership write failure".to_string()));
        }

        let mut inner = self.inner.write().await;
        let Some(membership) = inner.memberships.get_mut(&membership_id) else {
            return Ok(None);
        };
        if membership.version != expected_version {
            return Ok(None);
        }

        membership.status = advance.status;
        membership.paid_months = advance.paid_months;
        membership.eligible = advance.eligible;
        membership.next_payment_due = advance.next_payment_due;
        membership.enrollment_fee_status = advance.enrollment_fee_status;
        membership.version += 1;
        membership.updated_at = OffsetDateTime::now_utc();
        Ok(Some(membership.clone()))
    }

    async fn update_subscription(
        &self,
        membership_id: Uuid,
        update: &SubscriptionUpdate,
    ) -> BillingResult<Membership> {
        let mut inner = self.inner.write().await;
        let membership = inner
            .memberships
            .get_mut(&membership_id)
            .ok_or(BillingError::MembershipNotFound(membership_id))?;

        membership.subscription_id = Some(update.subscription_id.clone());
        membership.subscription_status = update.status;
        membership.auto_pay_enabled = update.auto_pay_enabled;
        membership.version += 1;
        membership.updated_at = OffsetDateTime::now_utc();
        Ok(membership.clone())
    }
}

#[async_trait]
impl OrganizationStore for InMemoryStore {
    async fn get_organization_settings(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Option<OrganizationSettings>> {
        let inner = self.inner.read().await;
        Ok(inner
            .organizations
            .get(&organization_id)
            .map(|record| record.settings.clone()))
    }

    async fn next_invoice_sequence(&self, organization_id: Uuid) -> BillingResult<i64> {
        let mut inner = self.inner.write().await;
        let record = inner
            .organizations
            .get_mut(&organization_id)
            .ok_or(BillingError::OrganizationNotFound(organization_id))?;
        record.invoice_sequence += 1;
        Ok(record.invoice_sequence)
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryStore {
    async fn claim_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        let claimable = match inner.webhook_events.get(event_id) {
            Some(EventState::Done(WebhookEventOutcome::Success)) => false,
            Some(EventState::Processing { started_at }) => {
                let stale = now - *started_at >= self.processing_timeout;
                if stale {
                    tracing::warn!(event_id = %event_id, "Reclaiming webhook event stuck in processing");
                }
                stale
            }
            Some(EventState::Done(WebhookEventOutcome::Error)) | None => true,
        };

        if claimable {
            inner
                .webhook_events
                .insert(event_id.to_string(), EventState::Processing { started_at: now });
        }
        Ok(claimable)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: WebhookEventOutcome,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .webhook_events
            .insert(event_id.to_string(), EventState::Done(outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duesledger_shared::{BillingFrequency, PaymentMethod, PaymentType};

    fn new_payment(org: Uuid, membership: Uuid, txn: Option<&str>) -> NewPayment {
        NewPayment {
            organization_id: org,
            membership_id: membership,
            payment_type: PaymentType::Dues,
            amount_cents: 2_500,
            months_credited: 1,
            period_start: None,
            period_end: None,
            period_label: None,
            invoice_number: None,
            processor_transaction_id: txn.map(str::to_string),
            recorded_by: None,
            notes: None,
        }
    }

    fn completion() -> PaymentCompletion {
        PaymentCompletion {
            method: PaymentMethod::Cash,
            paid_at: OffsetDateTime::now_utc(),
            processor_transaction_id: None,
            recorded_by: None,
        }
    }

    #[tokio::test]
    async fn test_complete_only_once() {
        let store = InMemoryStore::new();
        let payment = store
            .insert_payment(new_payment(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap();

        let first = store
            .complete_payment_if_pending(payment.id, &completion())
            .await
            .unwrap();
        let second = store
            .complete_payment_if_pending(payment.id, &completion())
            .await
            .unwrap();

        assert_eq!(first.unwrap().status, PaymentStatus::Completed);
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_failed_payment_cannot_complete() {
        let store = InMemoryStore::new();
        let payment = store
            .insert_payment(new_payment(Uuid::new_v4(), Uuid::new_v4(), None))
            .await
            .unwrap();

        store.fail_payment_if_pending(payment.id, "declined").await.unwrap();
        let result = store
            .complete_payment_if_pending(payment.id, &completion())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_transaction_id_rejected() {
        let store = InMemoryStore::new();
        let org = Uuid::new_v4();
        let membership = Uuid::new_v4();
        store
            .insert_payment(new_payment(org, membership, Some("pi_1")))
            .await
            .unwrap();
        let dup = store
            .insert_payment(new_payment(org, membership, Some("pi_1")))
            .await;
        assert!(matches!(dup, Err(BillingError::Database(_))));
    }

    #[tokio::test]
    async fn test_membership_version_check() {
        let store = InMemoryStore::new();
        let membership = Membership::new(Uuid::new_v4(), Uuid::new_v4(), BillingFrequency::Monthly);
        let id = membership.id;
        store.insert_membership(membership.clone()).await;

        let advance = MembershipAdvance {
            status: membership.status,
            paid_months: 1,
            eligible: false,
            next_payment_due: None,
            enrollment_fee_status: membership.enrollment_fee_status,
        };

        let updated = store.advance_membership_if_version(id, 0, &advance).await.unwrap();
        assert_eq!(updated.unwrap().version, 1);

        let stale = store.advance_membership_if_version(id, 0, &advance).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_webhook_claims() {
        let store = InMemoryStore::new();
        assert!(store.claim_event("evt_1", "payment_intent.succeeded").await.unwrap());
        assert!(!store.claim_event("evt_1", "payment_intent.succeeded").await.unwrap());

        store
            .finish_event("evt_1", WebhookEventOutcome::Error, Some("boom"))
            .await
            .unwrap();
        // errored events may be retried
        assert!(store.claim_event("evt_1", "payment_intent.succeeded").await.unwrap());

        store
            .finish_event("evt_1", WebhookEventOutcome::Success, None)
            .await
            .unwrap();
        assert!(!store.claim_event("evt_1", "payment_intent.succeeded").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_processing_claim_is_reclaimed() {
        let store = InMemoryStore::new().with_processing_timeout(Duration::ZERO);
        assert!(store.claim_event("evt_stuck", "invoice.paid").await.unwrap());
        // The first worker never finished
        assert!(store.claim_event("evt_stuck", "invoice.paid").await.unwrap());

        store
            .finish_event("evt_stuck", WebhookEventOutcome::Success, None)
            .await
            .unwrap();
        assert!(!store.claim_event("evt_stuck", "invoice.paid").await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_processing_claim_is_not_reclaimed() {
        let store = InMemoryStore::new();
        assert!(store.claim_event("evt_busy", "invoice.paid").await.unwrap());
        assert!(!store.claim_event("evt_busy", "invoice.paid").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_membership_failures_are_counted() {
        let store = InMemoryStore::new();
        let membership = Membership::new(Uuid::new_v4(), Uuid::new_v4(), BillingFrequency::Monthly);
        let id = membership.id;
        store.insert_membership(membership.clone()).await;
        store.fail_membership_writes(1);

        let advance = MembershipAdvance {
            status: membership.status,
            paid_months: 1,
            eligible: false,
            next_payment_due: None,
            enrollment_fee_status: membership.enrollment_fee_status,
        };
        assert!(store.advance_membership_if_version(id, 0, &advance).await.is_err());
        assert!(store.advance_membership_if_version(id, 0, &advance).await.is_ok());
    }
}
