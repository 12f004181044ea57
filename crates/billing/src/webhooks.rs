//! Stripe webhook handling
//!
//! Verifies signatures, converts Stripe events into [`ProcessorEvent`]s and
//! reconciles them against payments and memberships. Each event is processed
//! at most once successfully: it is claimed in the webhook event log before
//! any work happens, and errored events may be redelivered and re-claimed.

use std::sync::Arc;

use duesledger_shared::{PaymentMethod, PaymentType, SubscriptionStatus};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::subscription_status;
use crate::error::{BillingError, BillingResult};
use crate::models::{Payment, SubscriptionUpdate};
use crate::processor::METADATA_PAYMENT_ID;
use crate::settlement::{RecordPayment, SettlementEngine, SettlementRequest};
use crate::store::{BillingStore, WebhookEventOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Signed timestamps older or newer than this are rejected
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Largest acceptable gap between the recorded base amount and the base
/// implied by the charged amount
const BASE_AMOUNT_TOLERANCE_CENTS: i64 = 1;

/// Check a `Stripe-Signature` header (`t=...,v1=...`) against the payload
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    let matched = signatures.iter().any(|sig| {
        hex::decode(sig)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Verify and parse a Stripe webhook event.
///
/// The async-stripe helper is tried first; payloads from newer API versions
/// that it cannot deserialize are verified manually and parsed leniently.
pub fn verify_event(payload: &str, header: &str, secret: &str) -> BillingResult<Event> {
    match Webhook::construct_event(payload, header, secret) {
        Ok(event) => return Ok(event),
        Err(e) => {
            tracing::debug!(stripe_error = %e, "Standard webhook parsing failed, verifying manually");
        }
    }

    verify_signature(
        payload,
        header,
        secret,
        OffsetDateTime::now_utc().unix_timestamp(),
    )?;

    serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::WebhookEventNotSupported(format!("unparseable event: {}", e))
    })
}

/// What a processor event means for billing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    PaymentSucceeded {
        transaction_id: String,
        /// Our payment id, from the intent's metadata
        payment_id: Option<Uuid>,
        amount_cents: i64,
    },
    PaymentFailed {
        transaction_id: String,
        payment_id: Option<Uuid>,
        reason: String,
    },
    /// A recurring subscription collected a billing period
    InvoicePaid {
        invoice_id: String,
        subscription_id: String,
        amount_cents: i64,
    },
    SubscriptionChanged {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    Ignored,
}

/// A verified webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub event: ProcessorEvent,
}

impl WebhookEvent {
    pub fn from_stripe(event: Event) -> Self {
        let id = event.id.to_string();
        let event_type = event.type_.to_string();
        let created = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let processor_event = match (event.type_, event.data.object) {
            (EventType::PaymentIntentSucceeded, EventObject::PaymentIntent(pi)) => {
                ProcessorEvent::PaymentSucceeded {
                    payment_id: metadata_payment_id(&pi.metadata),
                    transaction_id: pi.id.to_string(),
                    amount_cents: pi.amount,
                }
            }
            (EventType::PaymentIntentPaymentFailed, EventObject::PaymentIntent(pi)) => {
                ProcessorEvent::PaymentFailed {
                    payment_id: metadata_payment_id(&pi.metadata),
                    transaction_id: pi.id.to_string(),
                    reason: pi
                        .last_payment_error
                        .as_ref()
                        .and_then(|e| e.message.clone())
                        .unwrap_or_else(|| "Payment failed".to_string()),
                }
            }
            (EventType::InvoicePaid, EventObject::Invoice(invoice)) => {
                let subscription_id = match &invoice.subscription {
                    Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
                    Some(stripe::Expandable::Object(s)) => Some(s.id.to_string()),
                    None => None,
                };
                match subscription_id {
                    Some(subscription_id) => ProcessorEvent::InvoicePaid {
                        invoice_id: invoice.id.to_string(),
                        subscription_id,
                        amount_cents: invoice.amount_paid.unwrap_or(0),
                    },
                    // One-off invoices are not dues
                    None => ProcessorEvent::Ignored,
                }
            }
            (
                EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated,
                EventObject::Subscription(subscription),
            ) => ProcessorEvent::SubscriptionChanged {
                subscription_id: subscription.id.to_string(),
                status: subscription_status(subscription.status),
            },
            (EventType::CustomerSubscriptionDeleted, EventObject::Subscription(subscription)) => {
                ProcessorEvent::SubscriptionChanged {
                    subscription_id: subscription.id.to_string(),
                    status: SubscriptionStatus::Canceled,
                }
            }
            _ => ProcessorEvent::Ignored,
        };

        Self {
            id,
            event_type,
            created,
            event: processor_event,
        }
    }
}

fn metadata_payment_id(metadata: &std::collections::HashMap<String, String>) -> Option<Uuid> {
    let raw = metadata.get(METADATA_PAYMENT_ID)?;
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(payment_id = %raw, "Malformed payment id in processor metadata");
            None
        }
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Already processed, or being processed by another worker
    Duplicate,
    /// Nothing in our records corresponds to the event
    Ignored,
}

/// Applies processor events to payments and memberships
pub struct WebhookReconciler<S> {
    engine: Arc<SettlementEngine<S>>,
}

impl<S> WebhookReconciler<S>
where
    S: BillingStore + 'static,
{
    pub fn new(engine: Arc<SettlementEngine<S>>) -> Self {
        Self { engine }
    }

    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let store = self.engine.store();

        if !store.claim_event(&event.id, &event.event_type).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process(event).await;

        let (outcome, error_message) = match &result {
            Ok(_) => (WebhookEventOutcome::Success, None),
            Err(e) => (WebhookEventOutcome::Error, Some(e.to_string())),
        };
        if let Err(e) = store
            .finish_event(&event.id, outcome, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        if let Err(e) = &result {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook processing failed"
            );
        }

        result
    }

    async fn process(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match &event.event {
            ProcessorEvent::PaymentSucceeded {
                transaction_id,
                payment_id,
                amount_cents,
            } => {
                self.payment_succeeded(transaction_id, *payment_id, *amount_cents, event.created)
                    .await
            }
            ProcessorEvent::PaymentFailed {
                transaction_id,
                payment_id,
                reason,
            } => self.payment_failed(transaction_id, *payment_id, reason).await,
            ProcessorEvent::InvoicePaid {
                invoice_id,
                subscription_id,
                amount_cents,
            } => {
                self.invoice_paid(invoice_id, subscription_id, *amount_cents, event.created)
                    .await
            }
            ProcessorEvent::SubscriptionChanged {
                subscription_id,
                status,
            } => self.subscription_changed(subscription_id, *status).await,
            ProcessorEvent::Ignored => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    async fn find_payment(
        &self,
        transaction_id: &str,
        payment_id: Option<Uuid>,
    ) -> BillingResult<Option<Payment>> {
        let store = self.engine.store();
        if let Some(id) = payment_id {
            if let Some(payment) = store.get_payment(id).await? {
                return Ok(Some(payment));
            }
        }
        store.find_payment_by_transaction_id(transaction_id).await
    }

    async fn payment_succeeded(
        &self,
        transaction_id: &str,
        payment_id: Option<Uuid>,
        charged_cents: i64,
        paid_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let Some(payment) = self.find_payment(transaction_id, payment_id).await? else {
            tracing::warn!(
                transaction_id = %transaction_id,
                "Payment succeeded for unknown payment"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        self.check_charged_amount(&payment, charged_cents).await?;

        let outcome = self
            .engine
            .settle_payment(SettlementRequest {
                payment_id: payment.id,
                method: PaymentMethod::Stripe,
                paid_at,
                processor_transaction_id: Some(transaction_id.to_string()),
                recorded_by: None,
                subscription_id: None,
            })
            .await?;

        tracing::info!(
            payment_id = %payment.id,
            transaction_id = %transaction_id,
            already_settled = outcome.already_settled,
            "Card payment reconciled"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// Warn when the charged amount doesn't match the recorded base amount
    async fn check_charged_amount(&self, payment: &Payment, charged_cents: i64) -> BillingResult<()> {
        let Some(settings) = self
            .engine
            .store()
            .get_organization_settings(payment.organization_id)
            .await?
        else {
            return Ok(());
        };

        let implied_base = settings.fee_policy.reverse(charged_cents)?;
        if (implied_base - payment.amount_cents).abs() > BASE_AMOUNT_TOLERANCE_CENTS {
            tracing::warn!(
                payment_id = %payment.id,
                recorded_cents = payment.amount_cents,
                implied_base_cents = implied_base,
                charged_cents = charged_cents,
                "Charged amount does not match recorded payment"
            );
        }
        Ok(())
    }

    async fn payment_failed(
        &self,
        transaction_id: &str,
        payment_id: Option<Uuid>,
        reason: &str,
    ) -> BillingResult<WebhookOutcome> {
        let Some(payment) = self.find_payment(transaction_id, payment_id).await? else {
            tracing::warn!(transaction_id = %transaction_id, "Payment failed for unknown payment");
            return Ok(WebhookOutcome::Ignored);
        };

        match self.engine.fail_payment(payment.id, reason).await {
            Ok(_) => Ok(WebhookOutcome::Processed),
            Err(BillingError::PaymentTerminal { status, .. }) => {
                // A retry that succeeded may precede a stale failure event
                tracing::warn!(
                    payment_id = %payment.id,
                    status = %status,
                    "Ignoring failure event for settled payment"
                );
                Ok(WebhookOutcome::Ignored)
            }
            Err(e) => Err(e),
        }
    }

    async fn invoice_paid(
        &self,
        invoice_id: &str,
        subscription_id: &str,
        charged_cents: i64,
        paid_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let store = self.engine.store();
        let Some(membership) = store.find_membership_by_subscription(subscription_id).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                invoice_id = %invoice_id,
                "Invoice paid for unknown subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let base_cents = match store
            .get_organization_settings(membership.organization_id)
            .await?
        {
            Some(settings) => settings.fee_policy.reverse(charged_cents)?,
            None => return Err(BillingError::OrganizationNotFound(membership.organization_id)),
        };

        let recorded = self
            .engine
            .record_and_settle(RecordPayment {
                membership_id: membership.id,
                payment_type: PaymentType::Dues,
                amount_cents: base_cents,
                months: None,
                method: PaymentMethod::Stripe,
                paid_at,
                processor_transaction_id: Some(invoice_id.to_string()),
                recorded_by: None,
                subscription_id: Some(subscription_id.to_string()),
                period_start: None,
                notes: None,
            })
            .await?;

        tracing::info!(
            membership_id = %membership.id,
            payment_id = %recorded.payment.id,
            invoice_id = %invoice_id,
            paid_months = recorded.settlement.paid_months,
            "Subscription invoice applied"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn subscription_changed(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<WebhookOutcome> {
        let store = self.engine.store();
        let Some(membership) = store.find_membership_by_subscription(subscription_id).await? else {
            tracing::warn!(subscription_id = %subscription_id, "Update for unknown subscription");
            return Ok(WebhookOutcome::Ignored);
        };

        let updated = store
            .update_subscription(
                membership.id,
                &SubscriptionUpdate {
                    subscription_id: subscription_id.to_string(),
                    status,
                    auto_pay_enabled: status.is_billing(),
                },
            )
            .await?;

        if status == SubscriptionStatus::PastDue {
            tracing::warn!(
                membership_id = %updated.id,
                subscription_id = %subscription_id,
                "Subscription is past due"
            );
        }
        tracing::info!(
            membership_id = %updated.id,
            subscription_id = %subscription_id,
            status = %status,
            auto_pay_enabled = updated.auto_pay_enabled,
            "Subscription updated"
        );
        Ok(WebhookOutcome::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeePolicy;
    use crate::models::{Membership, NewPayment, OrganizationSettings};
    use crate::pricing::PlanPricing;
    use crate::store::memory::InMemoryStore;
    use crate::store::{MembershipStore, PaymentStore};
    use duesledger_shared::{BillingFrequency, PaymentStatus};
    use time::macros::datetime;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000, SECRET);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000, SECRET);
        let result = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, "whsec_other");
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000, SECRET);
        let result = verify_signature(payload, &header, SECRET, 1_700_000_000 + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = "{}";
        let valid = sign(payload, 1_700_000_000, SECRET);
        let v1 = valid.split_once("v1=").unwrap().1;
        let header = format!("t=1700000000,v1=deadbeef,v1={}", v1);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("{}", "garbage", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=1", SECRET, 1).is_err());
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        reconciler: WebhookReconciler<InMemoryStore>,
        org: Uuid,
    }

    async fn fixture(fee_policy: FeePolicy) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let org = Uuid::new_v4();
        store
            .insert_organization(OrganizationSettings {
                organization_id: org,
                name: "Riverside".to_string(),
                invoice_prefix: "RIV".to_string(),
                fee_policy,
                pricing: PlanPricing {
                    monthly_cents: 10_000,
                    ..Default::default()
                },
                enrollment_fee_cents: 0,
            })
            .await;
        let engine = Arc::new(SettlementEngine::new(store.clone()));
        Fixture {
            store,
            reconciler: WebhookReconciler::new(engine),
            org,
        }
    }

    fn event(id: &str, event: ProcessorEvent) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: "test.event".to_string(),
            created: datetime!(2025-06-01 09:30 UTC),
            event,
        }
    }

    impl Fixture {
        async fn pending_dues(&self) -> (Membership, Payment) {
            let membership = Membership::new(self.org, Uuid::new_v4(), BillingFrequency::Monthly);
            self.store.insert_membership(membership.clone()).await;
            let payment = self
                .store
                .insert_payment(NewPayment {
                    organization_id: self.org,
                    membership_id: membership.id,
                    payment_type: PaymentType::Dues,
                    amount_cents: 10_000,
                    months_credited: 1,
                    period_start: None,
                    period_end: None,
                    period_label: None,
                    invoice_number: None,
                    processor_transaction_id: None,
                    recorded_by: None,
                    notes: None,
                })
                .await
                .unwrap();
            (membership, payment)
        }
    }

    #[tokio::test]
    async fn test_payment_succeeded_settles_by_metadata() {
        let f = fixture(FeePolicy::default()).await;
        let (membership, payment) = f.pending_dues().await;

        let outcome = f
            .reconciler
            .handle_event(&event(
                "evt_pi_1",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_1".to_string(),
                    payment_id: Some(payment.id),
                    amount_cents: 10_330,
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let stored = f.store.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        assert_eq!(stored.method, Some(PaymentMethod::Stripe));
        assert_eq!(stored.processor_transaction_id.as_deref(), Some("pi_1"));
        let m = f.store.get_membership(membership.id).await.unwrap().unwrap();
        assert_eq!(m.paid_months, 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let f = fixture(FeePolicy::default()).await;
        let (membership, payment) = f.pending_dues().await;
        let delivery = event(
            "evt_dup",
            ProcessorEvent::PaymentSucceeded {
                transaction_id: "pi_dup".to_string(),
                payment_id: Some(payment.id),
                amount_cents: 10_330,
            },
        );

        f.reconciler.handle_event(&delivery).await.unwrap();
        let second = f.reconciler.handle_event(&delivery).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate);

        let m = f.store.get_membership(membership.id).await.unwrap().unwrap();
        assert_eq!(m.paid_months, 1);
    }

    #[tokio::test]
    async fn test_errored_event_can_be_redelivered() {
        let f = fixture(FeePolicy::default()).await;
        let (membership, payment) = f.pending_dues().await;
        let delivery = event(
            "evt_retry",
            ProcessorEvent::PaymentSucceeded {
                transaction_id: "pi_retry".to_string(),
                payment_id: Some(payment.id),
                amount_cents: 10_330,
            },
        );

        f.store.fail_membership_writes(1);
        assert!(f.reconciler.handle_event(&delivery).await.is_err());

        let outcome = f.reconciler.handle_event(&delivery).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        let m = f.store.get_membership(membership.id).await.unwrap().unwrap();
        assert_eq!(m.paid_months, 1);
    }

    #[tokio::test]
    async fn test_payment_failed_marks_payment() {
        let f = fixture(FeePolicy::default()).await;
        let (_, payment) = f.pending_dues().await;

        f.reconciler
            .handle_event(&event(
                "evt_fail",
                ProcessorEvent::PaymentFailed {
                    transaction_id: "pi_f".to_string(),
                    payment_id: Some(payment.id),
                    reason: "Your card was declined.".to_string(),
                },
            ))
            .await
            .unwrap();

        let stored = f.store.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn test_unknown_payment_is_ignored() {
        let f = fixture(FeePolicy::default()).await;
        let outcome = f
            .reconciler
            .handle_event(&event(
                "evt_unknown",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_nobody".to_string(),
                    payment_id: None,
                    amount_cents: 500,
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_invoice_paid_records_dues_once() {
        let f = fixture(FeePolicy::new(0, false).unwrap()).await;
        let mut membership = Membership::new(f.org, Uuid::new_v4(), BillingFrequency::Monthly);
        membership.auto_pay_enabled = true;
        membership.subscription_id = Some("sub_live".to_string());
        membership.subscription_status = SubscriptionStatus::Active;
        f.store.insert_membership(membership.clone()).await;

        let paid = |id: &str| {
            event(
                id,
                ProcessorEvent::InvoicePaid {
                    invoice_id: "in_1".to_string(),
                    subscription_id: "sub_live".to_string(),
                    amount_cents: 10_000,
                },
            )
        };

        // Separate deliveries of the same invoice still record one payment
        f.reconciler.handle_event(&paid("evt_a")).await.unwrap();
        f.reconciler.handle_event(&paid("evt_b")).await.unwrap();

        let payments = f
            .store
            .list_payments_for_membership(membership.id)
            .await
            .unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount_cents, 10_000);
        assert_eq!(payments[0].processor_transaction_id.as_deref(), Some("in_1"));

        let m = f.store.get_membership(membership.id).await.unwrap().unwrap();
        assert_eq!(m.paid_months, 1);
    }

    #[tokio::test]
    async fn test_subscription_canceled_disables_auto_pay() {
        let f = fixture(FeePolicy::default()).await;
        let mut membership = Membership::new(f.org, Uuid::new_v4(), BillingFrequency::Annual);
        membership.auto_pay_enabled = true;
        membership.subscription_id = Some("sub_x".to_string());
        membership.subscription_status = SubscriptionStatus::Active;
        f.store.insert_membership(membership.clone()).await;

        f.reconciler
            .handle_event(&event(
                "evt_sub",
                ProcessorEvent::SubscriptionChanged {
                    subscription_id: "sub_x".to_string(),
                    status: SubscriptionStatus::Canceled,
                },
            ))
            .await
            .unwrap();

        let m = f.store.get_membership(membership.id).await.unwrap().unwrap();
        assert_eq!(m.subscription_status, SubscriptionStatus::Canceled);
        assert!(!m.auto_pay_enabled);
        assert!(!m.has_active_recurring_billing());
    }
}
