// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Fee calculation (BILL-F01 to BILL-F06)
//! - Settlement (BILL-S01 to BILL-S09)
//! - Periods and invoice numbers (BILL-P01 to BILL-P04)
//! - Webhook reconciliation (BILL-W01 to BILL-W05)

#[cfg(test)]
mod fee_tests {
    use crate::error::BillingError;
    use crate::fees::*;

    // =========================================================================
    // BILL-F01: Zero base in gross-up mode still charges the fixed fee
    // =========================================================================
    #[test]
    fn test_zero_base_gross_up_charges_something() {
        let fees = calculate_fees(0, 0.0, true).unwrap();
        assert!(fees.charge_amount_cents > 0, "Fixed fee must be covered");
        assert_eq!(fees.net_amount_cents, 0);
        assert!(fees.charge_amount_cents - fees.processor_fee_cents >= -1);
    }

    // =========================================================================
    // BILL-F02: Zero base in standard mode nets negative (org absorbs the fee)
    // =========================================================================
    #[test]
    fn test_zero_base_standard_nets_negative() {
        let fees = calculate_fees(0, 0.0, false).unwrap();
        assert_eq!(fees.charge_amount_cents, 0);
        assert_eq!(fees.processor_fee_cents, PROCESSOR_FIXED_CENTS);
        assert_eq!(fees.net_amount_cents, -PROCESSOR_FIXED_CENTS);
    }

    // =========================================================================
    // BILL-F03: Amount at the ceiling accepted, one cent over rejected
    // =========================================================================
    #[test]
    fn test_amount_ceiling() {
        assert!(calculate_fees(MAX_AMOUNT_CENTS, 0.0, true).is_ok());
        assert!(matches!(
            calculate_fees(MAX_AMOUNT_CENTS + 1, 0.0, true),
            Err(BillingError::InvalidAmount(_))
        ));
    }

    // =========================================================================
    // BILL-F04: Non-finite and negative platform fees rejected
    // =========================================================================
    #[test]
    fn test_bad_platform_fees_rejected() {
        for fee in [f64::NAN, f64::INFINITY, -0.01] {
            assert!(
                matches!(
                    calculate_fees(1_000, fee, false),
                    Err(BillingError::InvalidAmount(_))
                ),
                "platform fee {} should be rejected",
                fee
            );
        }
    }

    // =========================================================================
    // BILL-F05: Reverse calculation of a tiny charge clamps at zero
    // =========================================================================
    #[test]
    fn test_reverse_tiny_charge_clamps() {
        assert_eq!(reverse_calculate_base_amount(10, 0.0, true).unwrap(), 0);
        assert_eq!(reverse_calculate_base_amount(100, 2.0, false).unwrap(), 0);
    }

    // =========================================================================
    // BILL-F06: Platform fee dollars round to the nearest cent once
    // =========================================================================
    #[test]
    fn test_platform_fee_rounding() {
        let fees = calculate_fees(10_000, 1.005, false).unwrap();
        assert!(
            fees.platform_fee_cents == 100 || fees.platform_fee_cents == 101,
            "1.005 dollars must round to 100 or 101 cents, got {}",
            fees.platform_fee_cents
        );
        let fees = calculate_fees(10_000, 2.499_999, false).unwrap();
        assert_eq!(fees.platform_fee_cents, 250);
    }
}

#[cfg(test)]
mod settlement_tests {
    use std::sync::Arc;

    use duesledger_shared::{
        BillingFrequency, MembershipStatus, PaymentMethod, PaymentStatus, PaymentType,
        SubscriptionStatus,
    };
    use time::macros::{date, datetime};
    use tokio::sync::Barrier;
    use uuid::Uuid;

    use crate::error::BillingError;
    use crate::models::{Membership, NewPayment, Payment};
    use crate::settlement::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{MembershipStore, PaymentStore};

    async fn setup() -> (Arc<InMemoryStore>, Arc<SettlementEngine<InMemoryStore>>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let org = store.seed_organization("Eastside", "EST").await;
        let engine = Arc::new(SettlementEngine::new(store.clone()));
        (store, engine, org)
    }

    async fn membership(store: &InMemoryStore, org: Uuid, paid_months: i32) -> Membership {
        let mut m = Membership::new(org, Uuid::new_v4(), BillingFrequency::Monthly);
        m.paid_months = paid_months;
        m.eligible = paid_months >= 60;
        store.insert_membership(m.clone()).await;
        m
    }

    async fn pending(store: &InMemoryStore, m: &Membership, months: i32) -> Payment {
        store
            .insert_payment(NewPayment {
                organization_id: m.organization_id,
                membership_id: m.id,
                payment_type: if months > 1 {
                    PaymentType::BackDues
                } else {
                    PaymentType::Dues
                },
                amount_cents: 2_500 * i64::from(months),
                months_credited: months,
                period_start: None,
                period_end: None,
                period_label: None,
                invoice_number: None,
                processor_transaction_id: None,
                recorded_by: None,
                notes: None,
            })
            .await
            .unwrap()
    }

    fn request(payment_id: Uuid) -> SettlementRequest {
        SettlementRequest {
            payment_id,
            method: PaymentMethod::Zelle,
            paid_at: datetime!(2025-01-31 18:00 UTC),
            processor_transaction_id: None,
            recorded_by: Some(Uuid::new_v4()),
            subscription_id: None,
        }
    }

    // =========================================================================
    // BILL-S01: Already eligible membership at the cap stays put
    // =========================================================================
    #[tokio::test]
    async fn test_settle_at_cap_applies_nothing() {
        let (store, engine, org) = setup().await;
        let m = membership(&store, org, 60).await;
        let p = pending(&store, &m, 1).await;

        let outcome = engine.settle_payment(request(p.id)).await.unwrap();
        assert_eq!(outcome.paid_months, 60);
        assert_eq!(outcome.months_applied, 0);
        assert!(!outcome.became_eligible, "Eligibility must not fire twice");
        // Payment still completes and due date still advances
        assert!(outcome.next_payment_due.is_some());
    }

    // =========================================================================
    // BILL-S02: 59 paid + 12 months back dues -> 60, eligible once
    // =========================================================================
    #[tokio::test]
    async fn test_crossing_with_large_back_dues() {
        let (store, engine, org) = setup().await;
        let m = membership(&store, org, 59).await;
        let p = pending(&store, &m, 12).await;

        let outcome = engine.settle_payment(request(p.id)).await.unwrap();
        assert_eq!(outcome.paid_months, 60);
        assert_eq!(outcome.months_applied, 1);
        assert!(outcome.became_eligible);
    }

    // =========================================================================
    // BILL-S03: Custom threshold is honored
    // =========================================================================
    #[tokio::test]
    async fn test_custom_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let org = store.seed_organization("Northside", "NTH").await;
        let engine = SettlementEngine::new(store.clone()).with_eligibility_threshold(12);
        let m = membership(&store, org, 11).await;
        let p = pending(&store, &m, 1).await;

        let outcome = engine.settle_payment(request(p.id)).await.unwrap();
        assert_eq!(outcome.paid_months, 12);
        assert!(outcome.became_eligible);
    }

    // =========================================================================
    // BILL-S04: Due date on Jan 31 + 1 month clamps to Feb 28
    // =========================================================================
    #[tokio::test]
    async fn test_due_date_month_end_clamp() {
        let (store, engine, org) = setup().await;
        let m = membership(&store, org, 0).await;
        let p = pending(&store, &m, 1).await;

        let outcome = engine.settle_payment(request(p.id)).await.unwrap();
        assert_eq!(outcome.next_payment_due, Some(date!(2025 - 02 - 28)));
    }

    // =========================================================================
    // BILL-S05: Many payments settled concurrently on one membership all apply
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_distinct_payments_all_apply() {
        let (store, engine, org) = setup().await;
        let m = membership(&store, org, 0).await;

        let mut payment_ids = Vec::new();
        for _ in 0..10 {
            payment_ids.push(pending(&store, &m, 1).await.id);
        }

        let barrier = Arc::new(Barrier::new(payment_ids.len()));
        let mut handles = vec![];
        for id in payment_ids {
            let engine = engine.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.settle_payment(request(id)).await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(!outcome.already_settled);
        }

        let stored = store.get_membership(m.id).await.unwrap().unwrap();
        assert_eq!(stored.paid_months, 10, "No settlement may be lost");
        assert_eq!(stored.version, 10);
    }

    // =========================================================================
    // BILL-S06: Stale membership version rolls the payment back
    // =========================================================================
    #[tokio::test]
    async fn test_version_mismatch_rolls_back() {
        let (store, _, org) = setup().await;
        let m = membership(&store, org, 5).await;
        let p = pending(&store, &m, 1).await;

        // An engine whose lock map is separate, racing a direct write
        let engine = SettlementEngine::new(store.clone());
        let completed = store
            .complete_payment_if_pending(
                p.id,
                &crate::models::PaymentCompletion {
                    method: PaymentMethod::Cash,
                    paid_at: datetime!(2025-01-31 18:00 UTC),
                    processor_transaction_id: None,
                    recorded_by: None,
                },
            )
            .await
            .unwrap()
            .unwrap();
        let plan = plan_advance(&m, &completed, date!(2025 - 01 - 31), 60).unwrap();

        // Someone else advanced the membership first
        store
            .advance_membership_if_version(m.id, m.version, &plan.advance)
            .await
            .unwrap()
            .unwrap();
        let stale = store
            .advance_membership_if_version(m.id, m.version, &plan.advance)
            .await
            .unwrap();
        assert!(stale.is_none(), "Stale version must not apply");

        // The engine treats the completed payment as settled
        let outcome = engine.settle_payment(request(p.id)).await.unwrap();
        assert!(outcome.already_settled);
    }

    // =========================================================================
    // BILL-S07: Paused subscription does not block manual dues
    // =========================================================================
    #[tokio::test]
    async fn test_paused_subscription_allows_manual_dues() {
        let (store, engine, org) = setup().await;
        let mut m = Membership::new(org, Uuid::new_v4(), BillingFrequency::Monthly);
        m.auto_pay_enabled = true;
        m.subscription_id = Some("sub_paused".to_string());
        m.subscription_status = SubscriptionStatus::Paused;
        store.insert_membership(m.clone()).await;
        let p = pending(&store, &m, 1).await;

        assert!(engine.settle_payment(request(p.id)).await.is_ok());
    }

    // =========================================================================
    // BILL-S08: Attribution to a different subscription does not pass the guard
    // =========================================================================
    #[tokio::test]
    async fn test_foreign_subscription_attribution_blocked() {
        let (store, engine, org) = setup().await;
        let mut m = Membership::new(org, Uuid::new_v4(), BillingFrequency::Monthly);
        m.auto_pay_enabled = true;
        m.subscription_id = Some("sub_mine".to_string());
        m.subscription_status = SubscriptionStatus::Active;
        store.insert_membership(m.clone()).await;
        let p = pending(&store, &m, 1).await;

        let mut req = request(p.id);
        req.subscription_id = Some("sub_someone_else".to_string());
        assert!(matches!(
            engine.settle_payment(req).await,
            Err(BillingError::SubscriptionConflict { .. })
        ));
    }

    // =========================================================================
    // BILL-S09: Pending payment created ahead of a card charge settles later
    // =========================================================================
    #[tokio::test]
    async fn test_pending_then_settle() {
        let (store, engine, org) = setup().await;
        let m = membership(&store, org, 0).await;

        let (payment, variance) = engine
            .create_pending_payment(&RecordPayment {
                membership_id: m.id,
                payment_type: PaymentType::Dues,
                amount_cents: 2_500,
                months: None,
                method: PaymentMethod::Stripe,
                paid_at: datetime!(2025-04-02 10:00 UTC),
                processor_transaction_id: None,
                recorded_by: None,
                subscription_id: None,
                period_start: None,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.period_label.as_deref(), Some("April 2025"));
        assert!(!variance.flagged);

        let outcome = engine.settle_payment(request(payment.id)).await.unwrap();
        assert_eq!(outcome.paid_months, 1);
        assert_eq!(outcome.membership_status, MembershipStatus::Active);
    }
}

#[cfg(test)]
mod period_tests {
    use crate::periods::*;
    use time::macros::date;

    // =========================================================================
    // BILL-P01: Leap day anchor + 12 months clamps to Feb 28
    // =========================================================================
    #[test]
    fn test_leap_day_anchor() {
        assert_eq!(add_months(date!(2024 - 02 - 29), 12).unwrap(), date!(2025 - 02 - 28));
    }

    // =========================================================================
    // BILL-P02: Annual period starting mid-year spans two years in the label
    // =========================================================================
    #[test]
    fn test_annual_label_spans_years() {
        let (start, end) = period_bounds(date!(2025 - 07 - 01), 12).unwrap();
        assert_eq!(end, date!(2026 - 06 - 30));
        assert_eq!(period_label(start, end), "July 2025 - June 2026");
    }

    // =========================================================================
    // BILL-P03: Period starting on the 31st ends the day before the clamp
    // =========================================================================
    #[test]
    fn test_period_from_month_end() {
        let (_, end) = period_bounds(date!(2025 - 01 - 31), 1).unwrap();
        assert_eq!(end, date!(2025 - 02 - 27));
    }

    // =========================================================================
    // BILL-P04: Invoice prefix is normalized
    // =========================================================================
    #[test]
    fn test_invoice_prefix_normalized() {
        assert_eq!(format_invoice_number(" est ", 2025, 1), "EST-2025-00001");
    }
}

#[cfg(test)]
mod webhook_tests {
    use std::sync::Arc;

    use duesledger_shared::{BillingFrequency, PaymentStatus, PaymentType};
    use time::macros::datetime;
    use uuid::Uuid;

    use crate::models::{Membership, NewPayment};
    use crate::settlement::SettlementEngine;
    use crate::store::memory::InMemoryStore;
    use crate::store::{MembershipStore, PaymentStore, WebhookEventStore};
    use crate::webhooks::*;

    async fn setup() -> (Arc<InMemoryStore>, WebhookReconciler<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let org = store.seed_organization("Westside", "WST").await;
        let engine = Arc::new(SettlementEngine::new(store.clone()));
        (store, WebhookReconciler::new(engine), org)
    }

    async fn pending_with_txn(store: &InMemoryStore, org: Uuid, txn: &str) -> Uuid {
        let m = Membership::new(org, Uuid::new_v4(), BillingFrequency::Monthly);
        store.insert_membership(m.clone()).await;
        store
            .insert_payment(NewPayment {
                organization_id: org,
                membership_id: m.id,
                payment_type: PaymentType::Dues,
                amount_cents: 2_500,
                months_credited: 1,
                period_start: None,
                period_end: None,
                period_label: None,
                invoice_number: None,
                processor_transaction_id: Some(txn.to_string()),
                recorded_by: None,
                notes: None,
            })
            .await
            .unwrap()
            .id
    }

    fn delivery(id: &str, event: ProcessorEvent) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            created: datetime!(2025-02-01 00:00 UTC),
            event,
        }
    }

    // =========================================================================
    // BILL-W01: No metadata, located by transaction id
    // =========================================================================
    #[tokio::test]
    async fn test_locate_by_transaction_id() {
        let (store, reconciler, org) = setup().await;
        let payment_id = pending_with_txn(&store, org, "pi_lookup").await;

        reconciler
            .handle_event(&delivery(
                "evt_w01",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_lookup".to_string(),
                    payment_id: None,
                    amount_cents: 2_605,
                },
            ))
            .await
            .unwrap();

        let stored = store.get_payment(payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
    }

    // =========================================================================
    // BILL-W02: Amount mismatch is logged, not fatal
    // =========================================================================
    #[tokio::test]
    async fn test_amount_mismatch_still_settles() {
        let (store, reconciler, org) = setup().await;
        let payment_id = pending_with_txn(&store, org, "pi_off").await;

        let outcome = reconciler
            .handle_event(&delivery(
                "evt_w02",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_off".to_string(),
                    payment_id: Some(payment_id),
                    amount_cents: 9_999,
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
    }

    // =========================================================================
    // BILL-W03: Failure event after success leaves the payment completed
    // =========================================================================
    #[tokio::test]
    async fn test_late_failure_after_success() {
        let (store, reconciler, org) = setup().await;
        let payment_id = pending_with_txn(&store, org, "pi_late").await;

        reconciler
            .handle_event(&delivery(
                "evt_ok",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_late".to_string(),
                    payment_id: Some(payment_id),
                    amount_cents: 2_605,
                },
            ))
            .await
            .unwrap();
        let outcome = reconciler
            .handle_event(&delivery(
                "evt_fail",
                ProcessorEvent::PaymentFailed {
                    transaction_id: "pi_late".to_string(),
                    payment_id: Some(payment_id),
                    reason: "declined".to_string(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(outcome, WebhookOutcome::Ignored);
        let stored = store.get_payment(payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
    }

    // =========================================================================
    // BILL-W04: Concurrent deliveries of one event process once
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicate_deliveries() {
        let (store, reconciler, org) = setup().await;
        let payment_id = pending_with_txn(&store, org, "pi_race").await;
        let reconciler = Arc::new(reconciler);
        let event = delivery(
            "evt_race",
            ProcessorEvent::PaymentSucceeded {
                transaction_id: "pi_race".to_string(),
                payment_id: Some(payment_id),
                amount_cents: 2_605,
            },
        );

        let mut handles = vec![];
        for _ in 0..5 {
            let reconciler = reconciler.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move { reconciler.handle_event(&event).await }));
        }

        let mut processed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == WebhookOutcome::Processed {
                processed += 1;
            }
        }
        assert_eq!(processed, 1);
    }

    // =========================================================================
    // BILL-W05: Claim abandoned by a crashed worker is taken over on redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_abandoned_claim_is_reclaimed() {
        let store = Arc::new(InMemoryStore::new().with_processing_timeout(time::Duration::ZERO));
        let org = store.seed_organization("Westside", "WST").await;
        let engine = Arc::new(SettlementEngine::new(store.clone()));
        let reconciler = WebhookReconciler::new(engine);
        let payment_id = pending_with_txn(&store, org, "pi_crashed").await;

        // A worker claimed the event and died before finishing it
        assert!(store
            .claim_event("evt_crashed", "payment_intent.succeeded")
            .await
            .unwrap());

        let outcome = reconciler
            .handle_event(&delivery(
                "evt_crashed",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_crashed".to_string(),
                    payment_id: Some(payment_id),
                    amount_cents: 2_605,
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let stored = store.get_payment(payment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Completed);
        let membership = store.get_membership(stored.membership_id).await.unwrap().unwrap();
        assert_eq!(membership.paid_months, 1);

        // Once finished, later deliveries are duplicates again
        let again = reconciler
            .handle_event(&delivery(
                "evt_crashed",
                ProcessorEvent::PaymentSucceeded {
                    transaction_id: "pi_crashed".to_string(),
                    payment_id: Some(payment_id),
                    amount_cents: 2_605,
                },
            ))
            .await
            .unwrap();
        assert_eq!(again, WebhookOutcome::Duplicate);
    }
}
