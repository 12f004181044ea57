//! Stripe client and configuration

use std::str::FromStr;

use async_trait::async_trait;
use duesledger_shared::SubscriptionStatus;
use stripe::{
    AccountId, CancelSubscription, CreateCustomer, CreatePaymentIntent,
    CreatePaymentIntentAutomaticPaymentMethods, CreateSubscription, CreateSubscriptionItems,
    Currency, Customer, CustomerId, PaymentIntent, Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    CreatedPaymentIntent, CustomerRequest, PaymentIntentRequest, PaymentProcessor,
    ProcessorSubscription, SubscriptionRequest,
};

/// Stripe credentials and account settings
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Organization's connected account; charges are created on it
    pub connected_account_id: Option<String>,
    pub currency: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let connected_account_id = std::env::var("STRIPE_CONNECTED_ACCOUNT_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let currency = std::env::var("STRIPE_CURRENCY").unwrap_or_else(|_| "usd".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            connected_account_id,
            currency: currency.to_lowercase(),
        })
    }

    fn currency(&self) -> BillingResult<Currency> {
        Currency::from_str(&self.currency)
            .map_err(|_| BillingError::Config(format!("unsupported currency: {}", self.currency)))
    }
}

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let mut inner = stripe::Client::new(config.secret_key.clone());
        if let Some(account) = config.connected_account_id.as_deref() {
            let account_id = account.parse::<AccountId>().map_err(|e| {
                BillingError::Config(format!("invalid connected account id: {}", e))
            })?;
            inner = inner.with_stripe_account(account_id);
        }

        Ok(Self { inner, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

pub(crate) fn subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    status.as_str().parse().unwrap_or_else(|_| {
        tracing::warn!(status = %status.as_str(), "Unrecognized Stripe subscription status");
        SubscriptionStatus::None
    })
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(&self, request: &CustomerRequest) -> BillingResult<String> {
        let params = CreateCustomer {
            email: Some(&request.email),
            name: Some(&request.name),
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        };

        let customer = Customer::create(&self.inner, params).await?;
        tracing::info!(customer_id = %customer.id, "Created Stripe customer");
        Ok(customer.id.to_string())
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> BillingResult<CreatedPaymentIntent> {
        let mut params = CreatePaymentIntent::new(request.amount_cents, self.config.currency()?);
        params.metadata = Some(request.metadata.clone());
        params.description = request.description.as_deref();
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            allow_redirects: None,
        });
        if let Some(customer) = request.customer_id.as_deref() {
            let customer_id = customer
                .parse::<CustomerId>()
                .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;
            params.customer = Some(customer_id);
        }
        // Application fees only apply to charges on a connected account
        if self.config.connected_account_id.is_some() && request.application_fee_cents > 0 {
            params.application_fee_amount = Some(request.application_fee_cents);
        }

        let intent = PaymentIntent::create(&self.inner, params).await?;
        tracing::info!(
            payment_intent_id = %intent.id,
            amount_cents = intent.amount,
            "Created Stripe payment intent"
        );

        Ok(CreatedPaymentIntent {
            id: intent.id.to_string(),
            client_secret: intent.client_secret,
            amount_cents: intent.amount,
        })
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> BillingResult<ProcessorSubscription> {
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid customer id: {}", e)))?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());

        let subscription = Subscription::create(&self.inner, params).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            status = %subscription.status.as_str(),
            "Created Stripe subscription"
        );

        Ok(ProcessorSubscription {
            id: subscription.id.to_string(),
            status: subscription_status(subscription.status),
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<ProcessorSubscription> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid subscription id: {}", e)))?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };
        let subscription = Subscription::cancel(&self.inner, &sub_id, params).await?;
        tracing::info!(subscription_id = %subscription.id, "Canceled Stripe subscription");

        Ok(ProcessorSubscription {
            id: subscription.id.to_string(),
            status: subscription_status(subscription.status),
        })
    }
}
