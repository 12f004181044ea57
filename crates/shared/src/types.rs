//! Shared domain types
//!
//! All enums persist as lowercase snake_case TEXT columns and serialize the
//! same way over JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or submitted string does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// How often a membership is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    Monthly,
    Biannual,
    Annual,
}

impl BillingFrequency {
    /// Number of months covered by one billing period
    pub fn months(&self) -> u32 {
        match self {
            BillingFrequency::Monthly => 1,
            BillingFrequency::Biannual => 6,
            BillingFrequency::Annual => 12,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingFrequency::Monthly => "monthly",
            BillingFrequency::Biannual => "biannual",
            BillingFrequency::Annual => "annual",
        }
    }
}

impl FromStr for BillingFrequency {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingFrequency::Monthly),
            "biannual" => Ok(BillingFrequency::Biannual),
            "annual" => Ok(BillingFrequency::Annual),
            _ => Err(UnknownVariant::new("billing frequency", s)),
        }
    }
}

impl fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a membership's recurring processor subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Trialing,
    Canceled,
    Paused,
    Incomplete,
    Unpaid,
    #[default]
    None,
}

impl SubscriptionStatus {
    /// Statuses in which the processor will keep charging the member
    pub fn is_billing(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::None => "none",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "paused" => Ok(SubscriptionStatus::Paused),
            // Stripe distinguishes the two; we don't
            "incomplete" | "incomplete_expired" => Ok(SubscriptionStatus::Incomplete),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "none" | "" => Ok(SubscriptionStatus::None),
            _ => Err(UnknownVariant::new("subscription status", s)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the one-time enrollment fee has been settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentFeeStatus {
    #[default]
    Unpaid,
    Paid,
    Waived,
}

impl EnrollmentFeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentFeeStatus::Unpaid => "unpaid",
            EnrollmentFeeStatus::Paid => "paid",
            EnrollmentFeeStatus::Waived => "waived",
        }
    }
}

impl FromStr for EnrollmentFeeStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(EnrollmentFeeStatus::Unpaid),
            "paid" => Ok(EnrollmentFeeStatus::Paid),
            "waived" => Ok(EnrollmentFeeStatus::Waived),
            _ => Err(UnknownVariant::new("enrollment fee status", s)),
        }
    }
}

impl fmt::Display for EnrollmentFeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    #[default]
    Pending,
    Active,
    Canceled,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Pending => "pending",
            MembershipStatus::Active => "active",
            MembershipStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MembershipStatus::Pending),
            "active" => Ok(MembershipStatus::Active),
            "canceled" => Ok(MembershipStatus::Canceled),
            _ => Err(UnknownVariant::new("membership status", s)),
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a payment row pays for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    EnrollmentFee,
    Dues,
    BackDues,
}

impl PaymentType {
    /// Dues-like payments credit months and carry invoice numbers
    pub fn credits_months(&self) -> bool {
        matches!(self, PaymentType::Dues | PaymentType::BackDues)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::EnrollmentFee => "enrollment_fee",
            PaymentType::Dues => "dues",
            PaymentType::BackDues => "back_dues",
        }
    }
}

impl FromStr for PaymentType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrollment_fee" => Ok(PaymentType::EnrollmentFee),
            "dues" => Ok(PaymentType::Dues),
            "back_dues" => Ok(PaymentType::BackDues),
            _ => Err(UnknownVariant::new("payment type", s)),
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment state machine: `pending -> completed | failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(UnknownVariant::new("payment status", s)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the money arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card or bank debit collected by the payment processor
    Stripe,
    Cash,
    Check,
    Zelle,
}

impl PaymentMethod {
    pub fn is_manual(&self) -> bool {
        !matches!(self, PaymentMethod::Stripe)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::Zelle => "zelle",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // "card" and "bank" are what older rows and the portal send
            "stripe" | "card" | "bank" => Ok(PaymentMethod::Stripe),
            "cash" => Ok(PaymentMethod::Cash),
            "check" => Ok(PaymentMethod::Check),
            "zelle" => Ok(PaymentMethod::Zelle),
            _ => Err(UnknownVariant::new("payment method", s)),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
