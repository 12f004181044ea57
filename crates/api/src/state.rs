//! Application state

use std::sync::Arc;

use duesledger_billing::{
    BillingService, BillingStore, InvariantChecker, PaymentProcessor, PgStore, StripeClient,
};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
pub struct AppState<S = PgStore> {
    pub config: Config,
    pub billing: Arc<BillingService<S>>,
    /// Card processor; charges are unavailable without it
    pub processor: Option<Arc<dyn PaymentProcessor>>,
    /// Secret used to verify processor webhooks
    pub webhook_secret: Option<String>,
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            billing: self.billing.clone(),
            processor: self.processor.clone(),
            webhook_secret: self.webhook_secret.clone(),
            invariants: self.invariants.clone(),
        }
    }
}

impl AppState<PgStore> {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let threshold = config.eligibility_threshold_months;
        let billing = Arc::new(BillingService::postgres(pool.clone(), threshold));
        let invariants = Arc::new(InvariantChecker::new(pool, threshold));

        let mut state = Self {
            config,
            billing,
            processor: None,
            webhook_secret: None,
            invariants: Some(invariants),
        };

        if state.config.enable_stripe {
            match StripeClient::from_env() {
                Ok(client) => {
                    tracing::info!(
                        connected_account = client.config().connected_account_id.is_some(),
                        "Stripe client initialized"
                    );
                    state.webhook_secret = Some(client.config().webhook_secret.clone());
                    state.processor = Some(Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!("Stripe not configured: {}", e);
                }
            }
        } else {
            tracing::info!("Stripe disabled via config (ENABLE_STRIPE=false)");
        }

        state
    }
}

impl<S> AppState<S>
where
    S: BillingStore + 'static,
{
    /// State over an arbitrary store, without a processor or invariant checks
    pub fn with_store(store: Arc<S>, config: Config) -> Self {
        let threshold = config.eligibility_threshold_months;
        Self {
            config,
            billing: Arc::new(BillingService::new(store, threshold)),
            processor: None,
            webhook_secret: None,
            invariants: None,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }
}
