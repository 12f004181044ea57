// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! DuesLedger API Library
//!
//! HTTP surface over the billing engine: fee previews, payment recording,
//! card charges, manual settlement, Stripe webhooks and invariant checks.
//! Authentication is the host's concern; mount these routes behind it.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
