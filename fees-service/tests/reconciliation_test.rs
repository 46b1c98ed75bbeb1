//! End-to-end reconciliation behavior against the in-memory backend.

mod common;

use chrono::{TimeZone, Utc};
use common::{date, dec, TestHarness};
use fees_service::error::FeeError;
use fees_service::models::{InvoiceStatus, PaymentMethod};
use fees_service::services::FeeStore;
use rust_decimal::Decimal;

#[tokio::test]
async fn payment_splits_across_invoices_oldest_period_first() {
    let h = TestHarness::new().await;
    let jan = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;
    let feb = h
        .seed_invoice(date(2030, 2, 1), date(2030, 2, 15), 2000)
        .await;
    let mar = h
        .seed_invoice(date(2030, 3, 1), date(2030, 3, 15), 4000)
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(4500),
            "PAY-100",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("reconcile");

    assert_eq!(summary.amount_applied, dec(4500));
    assert_eq!(summary.invoices_touched, vec![jan.invoice_id, feb.invoice_id]);
    assert!(summary.credit_created.is_none());
    assert!(!summary.already_processed);

    let jan = h.invoice(jan.invoice_id).await;
    assert_eq!(jan.amount_paid, dec(3000));
    assert_eq!(jan.parsed_status(), InvoiceStatus::Paid);

    let feb = h.invoice(feb.invoice_id).await;
    assert_eq!(feb.amount_paid, dec(1500));
    assert_eq!(feb.parsed_status(), InvoiceStatus::PartiallyPaid);

    let mar = h.invoice(mar.invoice_id).await;
    assert_eq!(mar.amount_paid, Decimal::ZERO);
    assert_eq!(mar.parsed_status(), InvoiceStatus::Unpaid);
}

#[tokio::test]
async fn same_period_invoices_are_paid_in_creation_order() {
    let h = TestHarness::new().await;

    // Same billing period; the earlier-created invoice wins the tie even
    // though the later one has the closer due date.
    let mut first = h
        .seed_invoice(date(2030, 3, 1), date(2030, 3, 20), 1000)
        .await;
    let mut second = h
        .seed_invoice(date(2030, 3, 1), date(2030, 3, 10), 1000)
        .await;
    first.created_utc = Utc.with_ymd_and_hms(2030, 2, 1, 9, 0, 0).unwrap();
    second.created_utc = Utc.with_ymd_and_hms(2030, 2, 1, 10, 0, 0).unwrap();
    h.store.insert_invoice(&first).await.expect("reinsert");
    h.store.insert_invoice(&second).await.expect("reinsert");

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(1500),
            "PAY-101",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("reconcile");

    assert_eq!(
        summary.invoices_touched,
        vec![first.invoice_id, second.invoice_id]
    );

    let first = h.invoice(first.invoice_id).await;
    assert_eq!(first.amount_paid, dec(1000));
    assert_eq!(first.parsed_status(), InvoiceStatus::Paid);

    let second = h.invoice(second.invoice_id).await;
    assert_eq!(second.amount_paid, dec(500));
    assert_eq!(second.parsed_status(), InvoiceStatus::PartiallyPaid);
}

#[tokio::test]
async fn overpayment_creates_credit_for_the_remainder() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 5000)
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(7000),
            "PAY-200",
            PaymentMethod::MobileMoney,
            Utc::now(),
        )
        .await
        .expect("reconcile");

    assert_eq!(summary.amount_applied, dec(5000));
    let credit_id = summary.credit_created.expect("credit created");

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.parsed_status(), InvoiceStatus::Paid);

    let credit = h.store.get_credit(credit_id).await.expect("credit entry");
    assert_eq!(credit.amount, dec(2000));
    assert_eq!(credit.remaining_amount, dec(2000));
    assert_eq!(credit.source_reference, "PAY-200");
}

#[tokio::test]
async fn payment_with_no_open_invoices_becomes_pure_credit() {
    let h = TestHarness::new().await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(1500),
            "PAY-300",
            PaymentMethod::Cash,
            Utc::now(),
        )
        .await
        .expect("reconcile");

    assert_eq!(summary.amount_applied, Decimal::ZERO);
    assert!(summary.invoices_touched.is_empty());
    let credit_id = summary.credit_created.expect("credit created");

    let balance = h
        .store
        .credit_balance(h.branch_id, h.student_id)
        .await
        .expect("balance");
    assert_eq!(balance, dec(1500));

    let credit = h.store.get_credit(credit_id).await.expect("credit entry");
    assert_eq!(credit.remaining_amount, dec(1500));
}

#[tokio::test]
async fn duplicate_reference_is_rejected_without_side_effects() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;

    h.engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(1000),
            "PAY-400",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("first reconcile");

    let err = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(1000),
            "PAY-400",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect_err("replay must be rejected");
    assert!(matches!(err, FeeError::DuplicateTransaction { .. }));

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(1000));
    assert_eq!(h.store.all_allocations().await.len(), 1);
}

#[tokio::test]
async fn same_reference_under_different_method_processes_independently() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 5000)
        .await;

    h.engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(2000),
            "REF-77",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("bank transfer");
    h.engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(2000),
            "REF-77",
            PaymentMethod::MobileMoney,
            Utc::now(),
        )
        .await
        .expect("mobile money");

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(4000));
}

#[tokio::test]
async fn unknown_student_is_rejected() {
    let h = TestHarness::new().await;
    let stranger = uuid::Uuid::new_v4();

    let err = h
        .engine
        .reconcile(
            h.branch_id,
            stranger,
            dec(1000),
            "PAY-500",
            PaymentMethod::Card,
            Utc::now(),
        )
        .await
        .expect_err("unknown student");
    assert!(matches!(err, FeeError::StudentNotFound(id) if id == stranger));
}

#[tokio::test]
async fn non_positive_amount_is_rejected() {
    let h = TestHarness::new().await;

    let err = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            Decimal::ZERO,
            "PAY-600",
            PaymentMethod::Cash,
            Utc::now(),
        )
        .await
        .expect_err("zero amount");
    assert!(matches!(err, FeeError::InvalidAmount(_)));
}

#[tokio::test]
async fn allocation_records_conserve_the_payment_amount() {
    let h = TestHarness::new().await;
    h.seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;
    h.seed_invoice(date(2030, 2, 1), date(2030, 2, 15), 2000)
        .await;

    h.engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(7000),
            "PAY-700",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("reconcile");

    let records = h
        .store
        .allocations_for_payment(h.branch_id, h.student_id, "PAY-700", PaymentMethod::BankTransfer)
        .await
        .expect("allocations");
    let total: Decimal = records.iter().map(|r| r.amount_applied).sum();
    assert_eq!(total, dec(7000));
    // Two invoice targets plus one credit remainder.
    assert_eq!(records.len(), 3);
    assert_eq!(records.iter().filter(|r| r.invoice_id.is_none()).count(), 1);
}

#[tokio::test]
async fn concurrent_payments_for_one_student_serialize_cleanly() {
    let h = std::sync::Arc::new(TestHarness::new().await);
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 6000)
        .await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.engine
                .reconcile(
                    h.branch_id,
                    h.student_id,
                    dec(1000),
                    &format!("PAY-C{}", i),
                    PaymentMethod::Cash,
                    Utc::now(),
                )
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("reconcile");
    }

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(4000));
    assert_eq!(invoice.parsed_status(), InvoiceStatus::PartiallyPaid);
}
