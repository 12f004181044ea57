//! Payment settlement
//!
//! Moves a payment from `pending` to `completed` and advances the owning
//! membership (paid months, eligibility, next due date, enrollment fee).
//!
//! Safety comes from three layers:
//!
//! 1. Idempotency: a completed payment settles again as a no-op.
//! 2. Conflict guard: manual dues are refused while a recurring
//!    subscription would collect the same period.
//! 3. Conditional writes: the payment completes only `WHERE status =
//!    'pending'` and the membership advances only at the version it was
//!    read at. A failed membership write reverts the payment.
//!
//! Settlements for one membership are also serialized in-process through
//! [`MembershipLocks`].

use std::collections::HashMap;
use std::sync::Arc;

use duesledger_shared::{
    EnrollmentFeeStatus, MembershipStatus, PaymentMethod, PaymentStatus, PaymentType,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Membership, MembershipAdvance, NewPayment, Payment, PaymentCompletion,
    DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS,
};
use crate::periods::{add_months, CalendarPeriodGenerator, PeriodGenerator, PeriodRequest};
use crate::pricing::{check_amount_variance, variance_against, AmountVariance};
use crate::store::BillingStore;

/// Upper bound on months one payment may credit (100 years)
pub const MAX_MONTHS_PER_PAYMENT: u32 = 1200;

/// Settle an existing pending payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    pub payment_id: Uuid,
    pub method: PaymentMethod,
    pub paid_at: OffsetDateTime,
    pub processor_transaction_id: Option<String>,
    /// Operator who recorded a manual payment
    pub recorded_by: Option<Uuid>,
    /// Set when the money came from the membership's own recurring
    /// subscription; exempts the settlement from the conflict guard.
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub payment_id: Uuid,
    pub membership_id: Uuid,
    /// The payment was already completed; nothing changed
    pub already_settled: bool,
    pub months_applied: i32,
    pub paid_months: i32,
    pub membership_status: MembershipStatus,
    pub eligible: bool,
    /// True only on the settlement that crossed the threshold
    pub became_eligible: bool,
    pub next_payment_due: Option<Date>,
    pub enrollment_fee_paid: bool,
}

impl SettlementOutcome {
    /// No-op outcome for a payment that was already completed. A membership
    /// deleted since then reports as canceled with no paid months.
    fn already_settled(payment: &Payment, membership: Option<&Membership>) -> Self {
        Self {
            payment_id: payment.id,
            membership_id: payment.membership_id,
            already_settled: true,
            months_applied: 0,
            paid_months: membership.map_or(0, |m| m.paid_months),
            membership_status: membership.map_or(MembershipStatus::Canceled, |m| m.status),
            eligible: membership.is_some_and(|m| m.eligible),
            became_eligible: false,
            next_payment_due: membership.and_then(|m| m.next_payment_due),
            enrollment_fee_paid: false,
        }
    }
}

/// Record a payment and settle it in one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPayment {
    pub membership_id: Uuid,
    pub payment_type: PaymentType,
    pub amount_cents: i64,
    /// Months to credit; defaults to one billing period for dues and is
    /// required for back dues.
    pub months: Option<u32>,
    pub method: PaymentMethod,
    pub paid_at: OffsetDateTime,
    pub processor_transaction_id: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub subscription_id: Option<String>,
    /// First day the payment covers; defaults to the membership's next due
    /// date, or the payment date when none is set.
    pub period_start: Option<Date>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSettlement {
    pub payment: Payment,
    pub settlement: SettlementOutcome,
    /// Amount compared against the organization's plan price
    pub variance: Option<AmountVariance>,
}

/// Keyed async locks serializing work per membership
#[derive(Default)]
pub struct MembershipLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MembershipLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, membership_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop entries nobody is holding or waiting on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(membership_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Membership changes produced by settling one payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvancePlan {
    pub advance: MembershipAdvance,
    pub months_applied: i32,
    pub became_eligible: bool,
    pub enrollment_fee_paid: bool,
}

/// Compute how settling `payment` advances `membership`.
///
/// Paid months saturate at `threshold` and never decrease. The next due date
/// moves by one billing period from the current due date (or the payment
/// date) only when months were credited.
pub fn plan_advance(
    membership: &Membership,
    payment: &Payment,
    paid_on: Date,
    threshold: i32,
) -> BillingResult<AdvancePlan> {
    let credited = payment.effective_months();
    let paid_months = membership
        .paid_months
        .saturating_add(credited)
        .min(threshold)
        .max(membership.paid_months);
    let months_applied = paid_months - membership.paid_months;

    let reached = paid_months >= threshold;
    let became_eligible = reached && !membership.eligible;
    let eligible = membership.eligible || reached;

    let next_payment_due = if credited > 0 {
        let anchor = membership.next_payment_due.unwrap_or(paid_on);
        Some(add_months(anchor, membership.billing_frequency.months())?)
    } else {
        membership.next_payment_due
    };

    let enrollment_fee_paid = payment.payment_type == PaymentType::EnrollmentFee
        && membership.enrollment_fee_status == EnrollmentFeeStatus::Unpaid;
    let enrollment_fee_status = if enrollment_fee_paid {
        EnrollmentFeeStatus::Paid
    } else {
        membership.enrollment_fee_status
    };

    let status = match membership.status {
        MembershipStatus::Pending => MembershipStatus::Active,
        other => other,
    };

    Ok(AdvancePlan {
        advance: MembershipAdvance {
            status,
            paid_months,
            eligible,
            next_payment_due,
            enrollment_fee_status,
        },
        months_applied,
        became_eligible,
        enrollment_fee_paid,
    })
}

/// Refuse manual dues while the membership's own subscription bills it
fn check_subscription_conflict(
    membership: &Membership,
    payment_type: PaymentType,
    attributed_subscription: Option<&str>,
) -> BillingResult<()> {
    if !payment_type.credits_months() || !membership.has_active_recurring_billing() {
        return Ok(());
    }

    let own = membership.subscription_id.as_deref();
    if attributed_subscription.is_some() && attributed_subscription == own {
        return Ok(());
    }

    Err(BillingError::SubscriptionConflict {
        membership_id: membership.id,
        subscription_id: membership.subscription_id.clone(),
        status: membership.subscription_status,
    })
}

pub struct SettlementEngine<S> {
    store: Arc<S>,
    periods: Arc<dyn PeriodGenerator>,
    eligibility_threshold_months: i32,
    locks: MembershipLocks,
}

impl<S> SettlementEngine<S>
where
    S: BillingStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            periods: Arc::new(CalendarPeriodGenerator::new(store.clone())),
            store,
            eligibility_threshold_months: DEFAULT_ELIGIBILITY_THRESHOLD_MONTHS,
            locks: MembershipLocks::new(),
        }
    }

    pub fn with_period_generator(mut self, periods: Arc<dyn PeriodGenerator>) -> Self {
        self.periods = periods;
        self
    }

    pub fn with_eligibility_threshold(mut self, months: i32) -> Self {
        self.eligibility_threshold_months = months.max(1);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn eligibility_threshold_months(&self) -> i32 {
        self.eligibility_threshold_months
    }

    /// Settle a pending payment
    pub async fn settle_payment(&self, request: SettlementRequest) -> BillingResult<SettlementOutcome> {
        let payment = self
            .store
            .get_payment(request.payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(request.payment_id))?;

        let _guard = self.locks.lock(payment.membership_id).await;
        self.settle_locked(&request).await
    }

    /// Insert a payment row and settle it.
    ///
    /// Idempotent on the processor transaction id: a retried call settles the
    /// existing row instead of inserting a second one. A failure after the
    /// row was inserted is reported as [`BillingError::PaymentRecordedNotApplied`].
    pub async fn record_and_settle(&self, record: RecordPayment) -> BillingResult<RecordedSettlement> {
        validate_record(&record)?;

        let _guard = self.locks.lock(record.membership_id).await;

        if let Some(txn) = record.processor_transaction_id.as_deref() {
            if let Some(existing) = self.store.find_payment_by_transaction_id(txn).await? {
                if existing.membership_id != record.membership_id {
                    tracing::warn!(
                        payment_id = %existing.id,
                        processor_transaction_id = %txn,
                        existing_membership_id = %existing.membership_id,
                        membership_id = %record.membership_id,
                        "Transaction id already recorded for another membership"
                    );
                    return Err(BillingError::TransactionConflict {
                        processor_transaction_id: txn.to_string(),
                        payment_id: existing.id,
                    });
                }
                tracing::info!(
                    payment_id = %existing.id,
                    processor_transaction_id = %txn,
                    "Payment already recorded for transaction, settling existing row"
                );
                let settlement = self
                    .settle_locked(&SettlementRequest {
                        payment_id: existing.id,
                        method: record.method,
                        paid_at: record.paid_at,
                        processor_transaction_id: record.processor_transaction_id.clone(),
                        recorded_by: record.recorded_by,
                        subscription_id: record.subscription_id.clone(),
                    })
                    .await?;
                let payment = self
                    .store
                    .get_payment(existing.id)
                    .await?
                    .ok_or(BillingError::PaymentNotFound(existing.id))?;
                return Ok(RecordedSettlement {
                    payment,
                    settlement,
                    variance: None,
                });
            }
        }

        let (payment, variance) = self.insert_pending(&record).await?;

        let settlement = self
            .settle_locked(&SettlementRequest {
                payment_id: payment.id,
                method: record.method,
                paid_at: record.paid_at,
                processor_transaction_id: record.processor_transaction_id.clone(),
                recorded_by: record.recorded_by,
                subscription_id: record.subscription_id.clone(),
            })
            .await
            .map_err(|e| {
                tracing::error!(
                    payment_id = %payment.id,
                    membership_id = %payment.membership_id,
                    error = %e,
                    "Payment recorded but settlement failed"
                );
                BillingError::PaymentRecordedNotApplied {
                    payment_id: payment.id,
                    reason: e.to_string(),
                }
            })?;

        let payment = self
            .store
            .get_payment(payment.id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment.id))?;

        Ok(RecordedSettlement {
            payment,
            settlement,
            variance: Some(variance),
        })
    }

    /// Insert a pending payment without settling it, e.g. ahead of a card
    /// charge that settles later through the processor webhook.
    pub async fn create_pending_payment(
        &self,
        record: &RecordPayment,
    ) -> BillingResult<(Payment, AmountVariance)> {
        validate_record(record)?;
        let _guard = self.locks.lock(record.membership_id).await;
        self.insert_pending(record).await
    }

    /// Validate against the membership, attach period metadata and insert the
    /// pending row; the caller holds the membership lock
    async fn insert_pending(&self, record: &RecordPayment) -> BillingResult<(Payment, AmountVariance)> {
        let membership = self
            .store
            .get_membership(record.membership_id)
            .await?
            .ok_or(BillingError::MembershipNotFound(record.membership_id))?;
        if membership.status == MembershipStatus::Canceled {
            return Err(BillingError::MembershipCanceled(membership.id));
        }
        check_subscription_conflict(
            &membership,
            record.payment_type,
            record.subscription_id.as_deref(),
        )?;

        let settings = self
            .store
            .get_organization_settings(membership.organization_id)
            .await?
            .ok_or(BillingError::OrganizationNotFound(membership.organization_id))?;

        let mut new_payment = NewPayment {
            organization_id: membership.organization_id,
            membership_id: membership.id,
            payment_type: record.payment_type,
            amount_cents: record.amount_cents,
            months_credited: 0,
            period_start: None,
            period_end: None,
            period_label: None,
            invoice_number: None,
            processor_transaction_id: record.processor_transaction_id.clone(),
            recorded_by: record.recorded_by,
            notes: record.notes.clone(),
        };

        let variance = if record.payment_type.credits_months() {
            let months = record
                .months
                .unwrap_or_else(|| membership.billing_frequency.months());
            let anchor = record
                .period_start
                .or(membership.next_payment_due)
                .unwrap_or_else(|| record.paid_at.date());
            let period = self
                .periods
                .generate(&PeriodRequest {
                    organization_id: membership.organization_id,
                    anchor,
                    frequency: membership.billing_frequency,
                    months: Some(months),
                })
                .await?;

            new_payment.months_credited = period.months_credited;
            new_payment.period_start = Some(period.period_start);
            new_payment.period_end = Some(period.period_end);
            new_payment.period_label = Some(period.period_label);
            new_payment.invoice_number = Some(period.invoice_number);

            check_amount_variance(record.amount_cents, &settings.pricing, months)
        } else {
            variance_against(record.amount_cents, settings.enrollment_fee_cents)
        };

        if variance.flagged {
            tracing::warn!(
                membership_id = %membership.id,
                amount_cents = variance.amount_cents,
                expected_cents = variance.expected_cents,
                variance_percent = variance.variance_percent,
                "Payment amount differs from plan price"
            );
        }

        let payment = self.store.insert_payment(new_payment).await?;
        tracing::debug!(
            payment_id = %payment.id,
            membership_id = %payment.membership_id,
            payment_type = %payment.payment_type,
            amount_cents = payment.amount_cents,
            "Pending payment recorded"
        );

        Ok((payment, variance))
    }

    /// Mark a pending payment failed. Failing an already failed payment is a
    /// no-op; a completed payment cannot fail.
    pub async fn fail_payment(&self, payment_id: Uuid, reason: &str) -> BillingResult<Payment> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        match payment.status {
            PaymentStatus::Failed => return Ok(payment),
            PaymentStatus::Completed => {
                return Err(BillingError::PaymentTerminal {
                    payment_id,
                    status: payment.status,
                })
            }
            PaymentStatus::Pending => {}
        }

        if let Some(failed) = self.store.fail_payment_if_pending(payment_id, reason).await? {
            tracing::info!(
                payment_id = %payment_id,
                membership_id = %failed.membership_id,
                reason = %reason,
                "Payment marked failed"
            );
            return Ok(failed);
        }

        // Lost a race; report whatever state won
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;
        match current.status {
            PaymentStatus::Failed => Ok(current),
            status => Err(BillingError::PaymentTerminal { payment_id, status }),
        }
    }

    /// Settlement body; the caller holds the membership lock
    async fn settle_locked(&self, request: &SettlementRequest) -> BillingResult<SettlementOutcome> {
        let payment_id = request.payment_id;
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        match payment.status {
            PaymentStatus::Completed => {
                tracing::debug!(payment_id = %payment_id, "Payment already settled");
                let membership = self.store.get_membership(payment.membership_id).await?;
                if membership.is_none() {
                    tracing::warn!(
                        payment_id = %payment_id,
                        membership_id = %payment.membership_id,
                        "Settled payment references a missing membership"
                    );
                }
                return Ok(SettlementOutcome::already_settled(&payment, membership.as_ref()));
            }
            PaymentStatus::Failed => {
                return Err(BillingError::PaymentTerminal {
                    payment_id,
                    status: payment.status,
                })
            }
            PaymentStatus::Pending => {}
        }

        let membership = self
            .store
            .get_membership(payment.membership_id)
            .await?
            .ok_or(BillingError::MembershipNotFound(payment.membership_id))?;

        if membership.status == MembershipStatus::Canceled {
            return Err(BillingError::MembershipCanceled(membership.id));
        }

        if let Err(e) = check_subscription_conflict(
            &membership,
            payment.payment_type,
            request.subscription_id.as_deref(),
        ) {
            tracing::warn!(
                payment_id = %payment_id,
                membership_id = %membership.id,
                subscription_id = ?membership.subscription_id,
                "Refusing manual dues while subscription is billing"
            );
            return Err(e);
        }

        let completion = PaymentCompletion {
            method: request.method,
            paid_at: request.paid_at,
            processor_transaction_id: request.processor_transaction_id.clone(),
            recorded_by: request.recorded_by,
        };

        let Some(completed) = self
            .store
            .complete_payment_if_pending(payment_id, &completion)
            .await?
        else {
            return self.resolve_lost_race(&payment, &membership).await;
        };

        let plan = match plan_advance(
            &membership,
            &completed,
            request.paid_at.date(),
            self.eligibility_threshold_months,
        ) {
            Ok(plan) => plan,
            Err(e) => return self.roll_back(&payment, e.to_string()).await,
        };

        let updated = match self
            .store
            .advance_membership_if_version(membership.id, membership.version, &plan.advance)
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                return self
                    .roll_back(&payment, "membership was modified concurrently".to_string())
                    .await
            }
            Err(e) => return self.roll_back(&payment, e.to_string()).await,
        };

        tracing::info!(
            payment_id = %payment_id,
            membership_id = %updated.id,
            payment_type = %completed.payment_type,
            method = %request.method,
            months_applied = plan.months_applied,
            paid_months = updated.paid_months,
            "Payment settled"
        );
        if plan.became_eligible {
            tracing::info!(
                membership_id = %updated.id,
                paid_months = updated.paid_months,
                "Membership reached eligibility"
            );
        }

        Ok(SettlementOutcome {
            payment_id,
            membership_id: updated.id,
            already_settled: false,
            months_applied: plan.months_applied,
            paid_months: updated.paid_months,
            membership_status: updated.status,
            eligible: updated.eligible,
            became_eligible: plan.became_eligible,
            next_payment_due: updated.next_payment_due,
            enrollment_fee_paid: plan.enrollment_fee_paid,
        })
    }

    /// The conditional completion matched nothing: another settlement or a
    /// failure got there first.
    async fn resolve_lost_race(
        &self,
        payment: &Payment,
        membership: &Membership,
    ) -> BillingResult<SettlementOutcome> {
        let payment_id = payment.id;
        let current = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(BillingError::PaymentNotFound(payment_id))?;

        match current.status {
            PaymentStatus::Completed => {
                tracing::debug!(payment_id = %payment_id, "Concurrent settlement won the race");
                let membership = self
                    .store
                    .get_membership(membership.id)
                    .await?
                    .unwrap_or_else(|| membership.clone());
                Ok(SettlementOutcome::already_settled(&current, Some(&membership)))
            }
            PaymentStatus::Failed => Err(BillingError::PaymentTerminal {
                payment_id,
                status: current.status,
            }),
            PaymentStatus::Pending => Err(BillingError::ConcurrentModification(membership.id)),
        }
    }

    /// Revert the payment to `previous`, its row before completion
    async fn roll_back(&self, previous: &Payment, reason: String) -> BillingResult<SettlementOutcome> {
        let payment_id = previous.id;
        match self.store.revert_payment_to_pending(previous).await {
            Ok(true) => {
                tracing::warn!(
                    payment_id = %payment_id,
                    reason = %reason,
                    "Membership update failed, payment reverted to pending"
                );
                Err(BillingError::SettlementRolledBack { payment_id, reason })
            }
            Ok(false) => {
                tracing::error!(
                    payment_id = %payment_id,
                    reason = %reason,
                    "Membership update failed and payment was no longer completed"
                );
                Err(BillingError::PartialSettlement { payment_id, reason })
            }
            Err(revert_error) => {
                tracing::error!(
                    payment_id = %payment_id,
                    reason = %reason,
                    error = %revert_error,
                    "Membership update failed and payment revert failed"
                );
                Err(BillingError::PartialSettlement {
                    payment_id,
                    reason: format!("{}; revert failed: {}", reason, revert_error),
                })
            }
        }
    }
}

fn validate_record(record: &RecordPayment) -> BillingResult<()> {
    if let Some(months) = record.months.filter(|m| *m > MAX_MONTHS_PER_PAYMENT) {
        return Err(BillingError::Validation(format!(
            "a payment may credit at most {} months, got {}",
            MAX_MONTHS_PER_PAYMENT, months
        )));
    }

    if record.amount_cents < 0 {
        return Err(BillingError::InvalidAmount(format!(
            "payment amount must not be negative: {}",
            record.amount_cents
        )));
    }

    match record.payment_type {
        PaymentType::EnrollmentFee => {
            if record.months.unwrap_or(0) != 0 {
                return Err(BillingError::Validation(
                    "enrollment fee payments cannot credit months".to_string(),
                ));
            }
        }
        PaymentType::BackDues => {
            if record.months.unwrap_or(0) == 0 {
                return Err(BillingError::Validation(
                    "back dues payments must credit at least one month".to_string(),
                ));
            }
        }
        PaymentType::Dues => {
            if record.months == Some(0) {
                return Err(BillingError::Validation(
                    "dues payments must credit at least one month".to_string(),
                ));
            }
        }
    }

    Ok(())
}
