//! Which notifications a billing outcome calls for
//!
//! Pure decisions only; delivery (email, push) belongs to the host.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingError;
use crate::models::Payment;
use crate::settlement::SettlementOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    PaymentReceipt {
        membership_id: Uuid,
        payment_id: Uuid,
        amount_cents: i64,
        invoice_number: Option<String>,
        period_label: Option<String>,
    },
    EligibilityReached {
        membership_id: Uuid,
        paid_months: i32,
    },
    PaymentFailed {
        membership_id: Uuid,
        payment_id: Uuid,
        reason: String,
    },
    /// An operator tried to record dues the subscription already collects
    SubscriptionConflict {
        membership_id: Uuid,
        subscription_id: Option<String>,
    },
}

/// A settled payment gets a receipt; the crossing settlement also announces
/// eligibility. Replays of an already settled payment notify nobody.
pub fn for_settlement(payment: &Payment, outcome: &SettlementOutcome) -> Vec<Notification> {
    if outcome.already_settled {
        return Vec::new();
    }

    let mut notifications = vec![Notification::PaymentReceipt {
        membership_id: outcome.membership_id,
        payment_id: payment.id,
        amount_cents: payment.amount_cents,
        invoice_number: payment.invoice_number.clone(),
        period_label: payment.period_label.clone(),
    }];

    if outcome.became_eligible {
        notifications.push(Notification::EligibilityReached {
            membership_id: outcome.membership_id,
            paid_months: outcome.paid_months,
        });
    }

    notifications
}

pub fn for_failed_payment(payment: &Payment) -> Vec<Notification> {
    vec![Notification::PaymentFailed {
        membership_id: payment.membership_id,
        payment_id: payment.id,
        reason: payment
            .failure_reason
            .clone()
            .unwrap_or_else(|| "Payment failed".to_string()),
    }]
}

pub fn for_error(error: &BillingError) -> Vec<Notification> {
    match error {
        BillingError::SubscriptionConflict {
            membership_id,
            subscription_id,
            ..
        } => vec![Notification::SubscriptionConflict {
            membership_id: *membership_id,
            subscription_id: subscription_id.clone(),
        }],
        _ => Vec::new(),
    }
}
