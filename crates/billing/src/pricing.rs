//! Plan pricing and amount-variance checks
//!
//! Used when an operator types in a manual payment: the amount is compared
//! with the plan's canonical price for the months being credited. A variance
//! above 1% is flagged for review but never blocks the payment.

use serde::{Deserialize, Serialize};

/// Variance above this percentage is flagged
pub const VARIANCE_THRESHOLD_PERCENT: i64 = 1;

/// Canonical dues prices for an organization, in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanPricing {
    pub monthly_cents: i64,
    pub biannual_cents: Option<i64>,
    pub annual_cents: Option<i64>,
}

impl PlanPricing {
    /// Canonical price for `months` of dues.
    ///
    /// Whole years are priced at the annual rate and remaining half-years at
    /// the biannual rate when those are configured; the rest is monthly.
    pub fn expected_amount_cents(&self, months: u32) -> i64 {
        let mut remaining = i64::from(months);
        let mut total = 0;

        if let Some(annual) = self.annual_cents {
            total += (remaining / 12) * annual;
            remaining %= 12;
        }
        if let Some(biannual) = self.biannual_cents {
            total += (remaining / 6) * biannual;
            remaining %= 6;
        }

        total + remaining * self.monthly_cents
    }
}

/// Outcome of comparing an entered amount against the plan price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmountVariance {
    pub amount_cents: i64,
    pub expected_cents: i64,
    /// `amount - expected`
    pub difference_cents: i64,
    /// Absolute difference relative to the expected price
    pub variance_percent: f64,
    pub flagged: bool,
}

pub fn check_amount_variance(
    amount_cents: i64,
    pricing: &PlanPricing,
    months: u32,
) -> AmountVariance {
    variance_against(amount_cents, pricing.expected_amount_cents(months))
}

/// Compare an amount with an explicit expected price
pub fn variance_against(amount_cents: i64, expected_cents: i64) -> AmountVariance {
    let difference_cents = amount_cents - expected_cents;

    let (variance_percent, flagged) = if expected_cents == 0 {
        if difference_cents == 0 {
            (0.0, false)
        } else {
            (100.0, true)
        }
    } else {
        (
            (difference_cents.abs() as f64 / expected_cents as f64) * 100.0,
            // integer comparison so the boundary itself is never flagged
            difference_cents.abs() * 100 > expected_cents * VARIANCE_THRESHOLD_PERCENT,
        )
    };

    AmountVariance {
        amount_cents,
        expected_cents,
        difference_cents,
        variance_percent,
        flagged,
    }
}
