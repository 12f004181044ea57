//! Payment processor seam
//!
//! The API injects a [`PaymentProcessor`] where it needs to talk to the card
//! processor; settlement never does. Requests and results here carry plain
//! ids and cents so callers don't depend on the Stripe types.

use std::collections::HashMap;

use async_trait::async_trait;
use duesledger_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;
use crate::models::Payment;

/// Metadata key carrying our payment id on a processor payment
pub const METADATA_PAYMENT_ID: &str = "payment_id";
pub const METADATA_MEMBERSHIP_ID: &str = "membership_id";
pub const METADATA_ORGANIZATION_ID: &str = "organization_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRequest {
    pub email: String,
    pub name: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    /// Total to charge the payer, fees included
    pub amount_cents: i64,
    /// Platform and processor share routed away from the organization
    pub application_fee_cents: i64,
    pub customer_id: Option<String>,
    pub description: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPaymentIntent {
    pub id: String,
    /// Handed to the browser to confirm the payment
    pub client_secret: Option<String>,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSubscription {
    pub id: String,
    pub status: SubscriptionStatus,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Returns the processor's customer id
    async fn create_customer(&self, request: &CustomerRequest) -> BillingResult<String>;

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> BillingResult<CreatedPaymentIntent>;

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> BillingResult<ProcessorSubscription>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<ProcessorSubscription>;
}

/// Metadata linking a processor payment back to our payment row
pub fn payment_metadata(payment: &Payment) -> HashMap<String, String> {
    HashMap::from([
        (METADATA_PAYMENT_ID.to_string(), payment.id.to_string()),
        (METADATA_MEMBERSHIP_ID.to_string(), payment.membership_id.to_string()),
        (
            METADATA_ORGANIZATION_ID.to_string(),
            payment.organization_id.to_string(),
        ),
    ])
}
