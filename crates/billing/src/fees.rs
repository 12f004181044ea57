//! Fee calculation
//!
//! Converts between the base amount an organization should net and the amount
//! charged to the payer's card. Two policies are supported:
//!
//! - **Standard**: the payer is charged the base plus the platform fee and the
//!   organization absorbs the processor fee.
//! - **Gross-up** (`pass_fees_to_member`): the charge is solved so that after
//!   the processor's percentage-plus-fixed fee and the platform fee are taken
//!   out, the organization keeps exactly the base amount.
//!
//! All arithmetic runs on integer cents with the processor rate expressed in
//! per-mille, so rounding is exact and reproducible. The platform fee arrives
//! in dollars and is converted once through [`dollars_to_cents`].

use duesledger_shared::{cents_to_dollars, dollars_to_cents};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Processor percentage fee, in per-mille (2.9%)
pub const PROCESSOR_PERCENT_PER_MILLE: i64 = 29;

/// Processor fixed fee per charge, in cents
pub const PROCESSOR_FIXED_CENTS: i64 = 30;

/// Largest amount accepted by the calculator ($10B). Keeps every intermediate
/// product well inside `i64`.
pub const MAX_AMOUNT_CENTS: i64 = 1_000_000_000_000;

const PER_MILLE: i64 = 1000;

/// Result of sizing a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// What the organization should receive for the dues
    pub base_amount_cents: i64,
    pub platform_fee_cents: i64,
    pub processor_fee_cents: i64,
    /// What the payer's card is charged
    pub charge_amount_cents: i64,
    /// What the organization keeps. Negative in standard mode when the fixed
    /// processor fee exceeds a tiny base.
    pub net_amount_cents: i64,
    /// Platform + processor fee, used when funds are split at the processor
    pub application_fee_cents: i64,
    pub pass_fees_to_member: bool,
}

/// Display mirror of [`FeeBreakdown`] in dollars
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdownDollars {
    pub base_amount: f64,
    pub platform_fee: f64,
    pub processor_fee: f64,
    pub charge_amount: f64,
    pub net_amount: f64,
    pub application_fee: f64,
}

impl FeeBreakdown {
    pub fn dollars(&self) -> FeeBreakdownDollars {
        FeeBreakdownDollars {
            base_amount: cents_to_dollars(self.base_amount_cents),
            platform_fee: cents_to_dollars(self.platform_fee_cents),
            processor_fee: cents_to_dollars(self.processor_fee_cents),
            charge_amount: cents_to_dollars(self.charge_amount_cents),
            net_amount: cents_to_dollars(self.net_amount_cents),
            application_fee: cents_to_dollars(self.application_fee_cents),
        }
    }
}

/// An organization's fee settings, already in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub platform_fee_cents: i64,
    pub pass_fees_to_member: bool,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            platform_fee_cents: 0,
            pass_fees_to_member: true,
        }
    }
}

impl FeePolicy {
    pub fn new(platform_fee_cents: i64, pass_fees_to_member: bool) -> BillingResult<Self> {
        check_amount("platform fee", platform_fee_cents)?;
        Ok(Self {
            platform_fee_cents,
            pass_fees_to_member,
        })
    }

    pub fn from_dollars(platform_fee_dollars: f64, pass_fees_to_member: bool) -> BillingResult<Self> {
        Self::new(platform_fee_cents(platform_fee_dollars)?, pass_fees_to_member)
    }

    pub fn calculate(&self, base_amount_cents: i64) -> BillingResult<FeeBreakdown> {
        calculate_fees_cents(
            base_amount_cents,
            self.platform_fee_cents,
            self.pass_fees_to_member,
        )
    }

    pub fn reverse(&self, charge_amount_cents: i64) -> BillingResult<i64> {
        reverse_calculate_base_amount_cents(
            charge_amount_cents,
            self.platform_fee_cents,
            self.pass_fees_to_member,
        )
    }
}

/// Size a charge for `base_amount_cents`.
///
/// Negative amounts and negative or non-finite platform fees are rejected.
pub fn calculate_fees(
    base_amount_cents: i64,
    platform_fee_dollars: f64,
    pass_fees_to_member: bool,
) -> BillingResult<FeeBreakdown> {
    calculate_fees_cents(
        base_amount_cents,
        platform_fee_cents(platform_fee_dollars)?,
        pass_fees_to_member,
    )
}

/// Recover the base amount from what was actually charged.
///
/// Exact in standard mode, within one cent in gross-up mode. Clamps at zero.
pub fn reverse_calculate_base_amount(
    charge_amount_cents: i64,
    platform_fee_dollars: f64,
    pass_fees_to_member: bool,
) -> BillingResult<i64> {
    reverse_calculate_base_amount_cents(
        charge_amount_cents,
        platform_fee_cents(platform_fee_dollars)?,
        pass_fees_to_member,
    )
}

pub fn calculate_fees_cents(
    base_amount_cents: i64,
    platform_fee_cents: i64,
    pass_fees_to_member: bool,
) -> BillingResult<FeeBreakdown> {
    check_amount("base amount", base_amount_cents)?;
    check_amount("platform fee", platform_fee_cents)?;

    let (charge_amount_cents, net_amount_cents, processor_fee_cents) = if pass_fees_to_member {
        let charge = gross_up(base_amount_cents + platform_fee_cents + PROCESSOR_FIXED_CENTS);
        // Net is the base by construction; the rounding slack stays with the org
        (charge, base_amount_cents, processor_fee(charge))
    } else {
        let charge = base_amount_cents + platform_fee_cents;
        let fee = processor_fee(charge);
        (charge, base_amount_cents - fee, fee)
    };

    Ok(FeeBreakdown {
        base_amount_cents,
        platform_fee_cents,
        processor_fee_cents,
        charge_amount_cents,
        net_amount_cents,
        application_fee_cents: platform_fee_cents + processor_fee_cents,
        pass_fees_to_member,
    })
}

pub fn reverse_calculate_base_amount_cents(
    charge_amount_cents: i64,
    platform_fee_cents: i64,
    pass_fees_to_member: bool,
) -> BillingResult<i64> {
    check_amount("charge amount", charge_amount_cents)?;
    check_amount("platform fee", platform_fee_cents)?;

    let base = if pass_fees_to_member {
        // floor(charge * (1 - rate)) - platform - fixed
        let retained = (charge_amount_cents * (PER_MILLE - PROCESSOR_PERCENT_PER_MILLE)) / PER_MILLE;
        retained - platform_fee_cents - PROCESSOR_FIXED_CENTS
    } else {
        charge_amount_cents - platform_fee_cents
    };

    Ok(base.max(0))
}

/// round(charge * rate) + fixed, half rounding up
fn processor_fee(charge_amount_cents: i64) -> i64 {
    (charge_amount_cents * PROCESSOR_PERCENT_PER_MILLE + PER_MILLE / 2) / PER_MILLE
        + PROCESSOR_FIXED_CENTS
}

/// ceil(amount / (1 - rate))
fn gross_up(amount_cents: i64) -> i64 {
    let divisor = PER_MILLE - PROCESSOR_PERCENT_PER_MILLE;
    (amount_cents * PER_MILLE + divisor - 1) / divisor
}

fn platform_fee_cents(platform_fee_dollars: f64) -> BillingResult<i64> {
    if platform_fee_dollars.is_nan() || platform_fee_dollars < 0.0 {
        return Err(BillingError::InvalidAmount(format!(
            "platform fee must be a non-negative number of dollars, got {}",
            platform_fee_dollars
        )));
    }
    dollars_to_cents(platform_fee_dollars).ok_or_else(|| {
        BillingError::InvalidAmount(format!(
            "platform fee out of range: {}",
            platform_fee_dollars
        ))
    })
}

fn check_amount(what: &str, cents: i64) -> BillingResult<()> {
    if cents < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "{} must not be negative, got {} cents",
            what, cents
        )));
    }
    if cents > MAX_AMOUNT_CENTS {
        return Err(BillingError::InvalidAmount(format!(
            "{} exceeds maximum of {} cents",
            what, MAX_AMOUNT_CENTS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_mode_example() {
        let fees = calculate_fees(10_000, 2.0, false).unwrap();
        assert_eq!(fees.platform_fee_cents, 200);
        assert_eq!(fees.charge_amount_cents, 10_200);
        // round(10200 * 0.029) + 30 = 296 + 30
        assert_eq!(fees.processor_fee_cents, 326);
        assert_eq!(fees.net_amount_cents, 9_674);
        assert_eq!(fees.application_fee_cents, 526);
    }

    #[test]
    fn test_gross_up_example() {
        let fees = calculate_fees(10_000, 0.0, true).unwrap();
        // ceil(10030 / 0.971)
        assert_eq!(fees.charge_amount_cents, 10_330);
        assert_eq!(fees.net_amount_cents, 10_000);
        assert_eq!(fees.processor_fee_cents, 330);
        assert_eq!(fees.application_fee_cents, 330);
    }

    #[test]
    fn test_gross_up_covers_fees() {
        for base in [0, 1, 99, 500, 2_500, 10_000, 123_457] {
            for platform in [0, 50, 200, 999] {
                let fees = calculate_fees_cents(base, platform, true).unwrap();
                let kept = fees.charge_amount_cents - fees.processor_fee_cents - platform;
                assert!(kept >= base - 1, "base={} platform={} kept={}", base, platform, kept);
            }
        }
    }

    #[test]
    fn test_zero_base_gross_up_still_charges() {
        let fees = calculate_fees(0, 0.0, true).unwrap();
        // ceil(30 / 0.971) = 31
        assert_eq!(fees.charge_amount_cents, 31);
        assert_eq!(fees.net_amount_cents, 0);
    }

    #[test]
    fn test_zero_base_standard_has_negative_net() {
        let fees = calculate_fees(0, 0.0, false).unwrap();
        assert_eq!(fees.charge_amount_cents, 0);
        assert_eq!(fees.processor_fee_cents, 30);
        assert_eq!(fees.net_amount_cents, -30);
    }

    #[test]
    fn test_negative_inputs_rejected() {
        assert!(matches!(
            calculate_fees(-1, 0.0, false),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            calculate_fees(100, -0.5, true),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            calculate_fees(100, f64::NAN, true),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            reverse_calculate_base_amount(-10, 0.0, true),
            Err(BillingError::InvalidAmount(_))
        ));
        assert!(matches!(
            reverse_calculate_base_amount(100, -1.0, false),
            Err(BillingError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_oversized_amount_rejected() {
        assert!(calculate_fees_cents(MAX_AMOUNT_CENTS + 1, 0, true).is_err());
        assert!(calculate_fees_cents(MAX_AMOUNT_CENTS, 0, true).is_ok());
    }

    #[test]
    fn test_reverse_standard() {
        assert_eq!(reverse_calculate_base_amount(10_200, 2.0, false).unwrap(), 10_000);
        assert_eq!(reverse_calculate_base_amount(100, 2.0, false).unwrap(), 0);
    }

    #[test]
    fn test_reverse_gross_up() {
        assert_eq!(reverse_calculate_base_amount(10_330, 0.0, true).unwrap(), 10_000);
        assert_eq!(reverse_calculate_base_amount(10, 0.0, true).unwrap(), 0);
        assert_eq!(reverse_calculate_base_amount(0, 0.0, true).unwrap(), 0);
    }

    #[test]
    fn test_default_policy_grosses_up() {
        let policy = FeePolicy::default();
        assert!(policy.pass_fees_to_member);
        assert_eq!(policy.reverse(10_330).unwrap(), 10_000);
    }

    #[test]
    fn test_policy_from_dollars() {
        let policy = FeePolicy::from_dollars(1.5, false).unwrap();
        assert_eq!(policy.platform_fee_cents, 150);
        let fees = policy.calculate(5_000).unwrap();
        assert_eq!(fees.charge_amount_cents, 5_150);
        assert!(FeePolicy::from_dollars(-1.0, false).is_err());
    }

    #[test]
    fn test_dollar_breakdown() {
        let dollars = calculate_fees(10_000, 2.0, false).unwrap().dollars();
        assert_eq!(dollars.charge_amount, 102.0);
        assert_eq!(dollars.processor_fee, 3.26);
        assert_eq!(dollars.net_amount, 96.74);
        assert_eq!(dollars.application_fee, 5.26);
    }
}
