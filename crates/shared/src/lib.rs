//! DuesLedger shared types
//!
//! Domain enums, the dollars/cents conversion point and database plumbing
//! shared by the billing engine and the API server.

pub mod db;
pub mod money;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use money::{cents_to_dollars, dollars_to_cents};
pub use types::{
    BillingFrequency, EnrollmentFeeStatus, MembershipStatus, PaymentMethod, PaymentStatus,
    PaymentType, SubscriptionStatus, UnknownVariant,
};
