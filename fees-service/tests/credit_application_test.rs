//! Credit ledger drain behavior when new invoices arrive.

mod common;

use chrono::Utc;
use common::{date, dec, TestHarness};
use fees_service::models::{AllocationRecord, CreditEntry, InvoiceStatus, PaymentMethod};
use fees_service::services::FeeStore;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Record of a credit drain, as the unit of work would have written it.
fn drain_record(h: &TestHarness, credit_id: Uuid, invoice_id: Uuid, amount: i64) -> AllocationRecord {
    AllocationRecord {
        allocation_id: Uuid::new_v4(),
        branch_id: h.branch_id,
        student_id: h.student_id,
        payment_reference: credit_id.to_string(),
        payment_method: PaymentMethod::Credit.as_str().to_string(),
        invoice_id: Some(invoice_id),
        amount_applied: dec(amount),
        applied_utc: Utc::now(),
    }
}

/// Build up stored credit by reconciling payments with no open invoices.
async fn seed_credit(h: &TestHarness, reference: &str, amount: i64) -> uuid::Uuid {
    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(amount),
            reference,
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("seed credit");
    summary.credit_created.expect("credit entry created")
}

#[tokio::test]
async fn credit_drains_oldest_entry_first() {
    let h = TestHarness::new().await;
    let first = seed_credit(&h, "PAY-A", 3000).await;
    let second = seed_credit(&h, "PAY-B", 4000).await;

    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 5000)
        .await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    assert_eq!(outcome.amount_applied, dec(5000));
    assert_eq!(outcome.credits_consumed, vec![first, second]);
    assert_eq!(outcome.invoice_status, InvoiceStatus::Paid);

    let first = h.store.get_credit(first).await.expect("first entry");
    assert_eq!(first.remaining_amount, Decimal::ZERO);
    assert_eq!(first.status, "exhausted");

    let second = h.store.get_credit(second).await.expect("second entry");
    assert_eq!(second.remaining_amount, dec(2000));
    assert_eq!(second.status, "available");

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(5000));
}

#[tokio::test]
async fn credit_smaller_than_invoice_leaves_it_partially_paid() {
    let h = TestHarness::new().await;
    let credit_id = seed_credit(&h, "PAY-C", 2000).await;

    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 5000)
        .await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    assert_eq!(outcome.amount_applied, dec(2000));
    assert_eq!(outcome.invoice_status, InvoiceStatus::PartiallyPaid);

    let credit = h.store.get_credit(credit_id).await.expect("credit entry");
    assert_eq!(credit.remaining_amount, Decimal::ZERO);

    let balance = h
        .store
        .credit_balance(h.branch_id, h.student_id)
        .await
        .expect("balance");
    assert_eq!(balance, Decimal::ZERO);
}

#[tokio::test]
async fn drained_credit_writes_allocation_records_per_entry() {
    let h = TestHarness::new().await;
    let first = seed_credit(&h, "PAY-D", 1000).await;
    let second = seed_credit(&h, "PAY-E", 1000).await;

    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 2000)
        .await;
    h.credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    let records = h
        .store
        .allocations_for_invoice(h.branch_id, invoice.invoice_id)
        .await
        .expect("allocations");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.payment_method == "credit"));

    let references: Vec<String> = records.iter().map(|r| r.payment_reference.clone()).collect();
    assert!(references.contains(&first.to_string()));
    assert!(references.contains(&second.to_string()));
}

#[tokio::test]
async fn settled_invoice_is_a_noop() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;
    h.engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(3000),
            "PAY-F",
            PaymentMethod::Cash,
            Utc::now(),
        )
        .await
        .expect("settle invoice");
    seed_credit(&h, "PAY-G", 1000).await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    assert_eq!(outcome.amount_applied, Decimal::ZERO);
    assert!(outcome.credits_consumed.is_empty());
    assert_eq!(outcome.invoice_status, InvoiceStatus::Paid);

    let balance = h
        .store
        .credit_balance(h.branch_id, h.student_id)
        .await
        .expect("balance");
    assert_eq!(balance, dec(1000));
}

#[tokio::test]
async fn interrupted_drain_is_finished_from_its_record() {
    let h = TestHarness::new().await;
    let credit_id = seed_credit(&h, "PAY-H", 1000).await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 1000)
        .await;

    // A previous application committed the drain record and then died:
    // the entry was never decremented, the invoice never credited.
    h.store
        .seed_allocation(drain_record(&h, credit_id, invoice.invoice_id, 1000))
        .await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    // The recorded drain is honored exactly once: entry and invoice are
    // caught up to the record, and nothing is drained on top of it.
    assert_eq!(outcome.amount_applied, dec(1000));
    assert!(outcome.credits_consumed.is_empty());
    assert_eq!(outcome.invoice_status, InvoiceStatus::Paid);

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(1000));

    let entry = h.store.get_credit(credit_id).await.expect("entry");
    assert_eq!(entry.remaining_amount, Decimal::ZERO);
    assert_eq!(entry.status, "exhausted");

    // No second record for the same entry and invoice.
    let records = h
        .store
        .allocations_for_invoice(h.branch_id, invoice.invoice_id)
        .await
        .expect("allocations");
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn drained_entry_with_lagging_invoice_is_caught_up() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 1000)
        .await;

    // Crash landed after the record and the entry decrement, leaving only
    // the invoice update undone.
    let mut entry = CreditEntry::new(
        Uuid::new_v4(),
        h.branch_id,
        h.student_id,
        dec(1000),
        "PAY-I".to_string(),
    );
    entry.drain(dec(1000)).expect("drain");
    let credit_id = entry.credit_id;
    h.store.seed_credit_entry(entry).await;
    h.store
        .seed_allocation(drain_record(&h, credit_id, invoice.invoice_id, 1000))
        .await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    assert_eq!(outcome.amount_applied, dec(1000));
    assert_eq!(outcome.invoice_status, InvoiceStatus::Paid);

    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, dec(1000));
    assert_eq!(
        h.store
            .allocations_for_invoice(h.branch_id, invoice.invoice_id)
            .await
            .expect("allocations")
            .len(),
        1
    );
}

#[tokio::test]
async fn applying_with_no_credit_available_is_a_noop() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;

    let outcome = h
        .credit
        .apply_credit_to_invoice(h.branch_id, h.student_id, invoice.invoice_id)
        .await
        .expect("apply credit");

    assert_eq!(outcome.amount_applied, Decimal::ZERO);
    let invoice = h.invoice(invoice.invoice_id).await;
    assert_eq!(invoice.amount_paid, Decimal::ZERO);
}
