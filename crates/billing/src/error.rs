//! Billing errors

use duesledger_shared::{PaymentStatus, SubscriptionStatus, UnknownVariant};
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification callers use to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    /// Money was recorded but not fully applied to the membership
    PartialFailure,
    InvalidInput,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment not found: {0}")]
    PaymentNotFound(Uuid),

    #[error("Membership not found: {0}")]
    MembershipNotFound(Uuid),

    #[error("Organization not found: {0}")]
    OrganizationNotFound(Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Membership {membership_id} has an active recurring subscription ({}: {status}); cancel it before recording a manual payment",
        .subscription_id.as_deref().unwrap_or("unknown")
    )]
    SubscriptionConflict {
        membership_id: Uuid,
        subscription_id: Option<String>,
        status: SubscriptionStatus,
    },

    #[error("Payment {payment_id} is already {status}")]
    PaymentTerminal {
        payment_id: Uuid,
        status: PaymentStatus,
    },

    #[error(
        "Transaction {processor_transaction_id} is already recorded as payment {payment_id} for another membership"
    )]
    TransactionConflict {
        processor_transaction_id: String,
        payment_id: Uuid,
    },

    #[error("Membership {0} is canceled")]
    MembershipCanceled(Uuid),

    #[error("Membership {0} was modified concurrently")]
    ConcurrentModification(Uuid),

    #[error("Settlement of payment {payment_id} rolled back: {reason}")]
    SettlementRolledBack { payment_id: Uuid, reason: String },

    #[error("Payment {payment_id} completed but membership was not advanced: {reason}")]
    PartialSettlement { payment_id: Uuid, reason: String },

    #[error("Payment {payment_id} recorded but not applied: {reason}")]
    PaymentRecordedNotApplied { payment_id: Uuid, reason: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::PaymentNotFound(_)
            | BillingError::MembershipNotFound(_)
            | BillingError::OrganizationNotFound(_)
            | BillingError::NotFound(_) => ErrorKind::NotFound,
            BillingError::SubscriptionConflict { .. }
            | BillingError::PaymentTerminal { .. }
            | BillingError::TransactionConflict { .. }
            | BillingError::MembershipCanceled(_)
            | BillingError::ConcurrentModification(_)
            | BillingError::SettlementRolledBack { .. } => ErrorKind::Conflict,
            BillingError::PartialSettlement { .. }
            | BillingError::PaymentRecordedNotApplied { .. } => ErrorKind::PartialFailure,
            BillingError::InvalidAmount(_)
            | BillingError::Validation(_)
            | BillingError::WebhookSignatureInvalid
            | BillingError::WebhookEventNotSupported(_) => ErrorKind::InvalidInput,
            BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::Stripe(_)
            | BillingError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            BillingError::MembershipNotFound(_) => "MEMBERSHIP_NOT_FOUND",
            BillingError::OrganizationNotFound(_) => "ORGANIZATION_NOT_FOUND",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::SubscriptionConflict { .. } => "SUBSCRIPTION_CONFLICT",
            BillingError::PaymentTerminal { .. } => "PAYMENT_TERMINAL",
            BillingError::TransactionConflict { .. } => "TRANSACTION_CONFLICT",
            BillingError::MembershipCanceled(_) => "MEMBERSHIP_CANCELED",
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::SettlementRolledBack { .. } => "SETTLEMENT_ROLLED_BACK",
            BillingError::PartialSettlement { .. } => "PARTIAL_SETTLEMENT",
            BillingError::PaymentRecordedNotApplied { .. } => "PAYMENT_RECORDED_NOT_APPLIED",
            BillingError::InvalidAmount(_) => "INVALID_AMOUNT",
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::StripeApi(_) | BillingError::Stripe(_) => "STRIPE_ERROR",
            BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            BillingError::WebhookEventNotSupported(_) => "WEBHOOK_EVENT_NOT_SUPPORTED",
            BillingError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<UnknownVariant> for BillingError {
    fn from(e: UnknownVariant) -> Self {
        BillingError::Database(format!("corrupt row: {}", e))
    }
}
