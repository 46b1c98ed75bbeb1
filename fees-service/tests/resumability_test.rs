//! Recovery behavior when a previous reconciliation attempt wrote some
//! allocation records but never reached its idempotency marker.

mod common;

use chrono::Utc;
use common::{date, dec, TestHarness};
use fees_service::error::FeeError;
use fees_service::models::{AllocationRecord, CreditEntry, InvoiceStatus, PaymentMethod};
use fees_service::services::FeeStore;
use rust_decimal::Decimal;
use uuid::Uuid;

fn prior_allocation(
    h: &TestHarness,
    reference: &str,
    invoice_id: Option<Uuid>,
    amount: i64,
) -> AllocationRecord {
    AllocationRecord {
        allocation_id: Uuid::new_v4(),
        branch_id: h.branch_id,
        student_id: h.student_id,
        payment_reference: reference.to_string(),
        payment_method: PaymentMethod::BankTransfer.as_str().to_string(),
        invoice_id,
        amount_applied: dec(amount),
        applied_utc: Utc::now(),
    }
}

#[tokio::test]
async fn resumed_payment_skips_already_allocated_invoices() {
    let h = TestHarness::new().await;

    // First pass crashed after fully paying the January invoice.
    let mut jan = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;
    jan.apply_amount(dec(3000), date(2030, 1, 2)).expect("prefill");
    h.store.insert_invoice(&jan).await.expect("reinsert");
    h.store
        .seed_allocation(prior_allocation(&h, "PAY-R1", Some(jan.invoice_id), 3000))
        .await;

    let feb = h
        .seed_invoice(date(2030, 2, 1), date(2030, 2, 15), 2000)
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(5000),
            "PAY-R1",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("resume");

    // Full payment accounted for: 3000 from the crashed pass, 2000 now.
    assert_eq!(summary.amount_applied, dec(5000));
    assert!(summary.invoices_touched.contains(&jan.invoice_id));
    assert!(summary.invoices_touched.contains(&feb.invoice_id));
    assert!(summary.credit_created.is_none());

    let jan = h.invoice(jan.invoice_id).await;
    assert_eq!(jan.amount_paid, dec(3000));
    let feb = h.invoice(feb.invoice_id).await;
    assert_eq!(feb.amount_paid, dec(2000));
    assert_eq!(feb.parsed_status(), InvoiceStatus::Paid);

    // The marker is now in place, so a further replay is a duplicate.
    let err = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(5000),
            "PAY-R1",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect_err("replay after completion");
    assert!(matches!(err, FeeError::DuplicateTransaction { .. }));
}

#[tokio::test]
async fn invoice_lagging_its_allocation_record_is_repaired_not_recharged() {
    let h = TestHarness::new().await;

    // First pass committed the allocation record but died before the
    // invoice update. The invoice still reads as fully unpaid.
    let jan = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 3000)
        .await;
    h.store
        .seed_allocation(prior_allocation(&h, "PAY-R4", Some(jan.invoice_id), 3000))
        .await;
    let feb = h
        .seed_invoice(date(2030, 2, 1), date(2030, 2, 15), 2000)
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(3000),
            "PAY-R4",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("resume");

    // The 3000 already on record is the whole payment. The resume catches
    // the invoice up and must not allocate the money a second time.
    assert_eq!(summary.amount_applied, dec(3000));
    assert!(summary.credit_created.is_none());

    let jan = h.invoice(jan.invoice_id).await;
    assert_eq!(jan.amount_paid, dec(3000));
    assert_eq!(jan.parsed_status(), InvoiceStatus::Paid);
    let feb = h.invoice(feb.invoice_id).await;
    assert_eq!(feb.amount_paid, Decimal::ZERO);

    // Only the seeded record: total ledger value stays at the payment.
    let records = h.store.all_allocations().await;
    assert_eq!(records.len(), 1);
    let total: Decimal = records.iter().map(|r| r.amount_applied).sum();
    assert_eq!(total, dec(3000));
}

#[tokio::test]
async fn credit_record_without_its_entry_is_reminted() {
    let h = TestHarness::new().await;

    // Crashed pass recorded the overpayment remainder but never wrote the
    // ledger entry the record describes.
    h.store
        .seed_allocation(prior_allocation(&h, "PAY-R5", None, 2000))
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(2000),
            "PAY-R5",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("resume");

    assert_eq!(summary.amount_applied, Decimal::ZERO);
    let credit_id = summary.credit_created.expect("entry reminted");

    let entry = h.store.get_credit(credit_id).await.expect("entry");
    assert_eq!(entry.remaining_amount, dec(2000));

    // The repair writes no second record.
    assert_eq!(h.store.all_allocations().await.len(), 1);
}

#[tokio::test]
async fn resumed_payment_does_not_double_create_credit() {
    let h = TestHarness::new().await;

    // Crashed pass wrote both the record and the ledger entry for the
    // overpayment remainder, then died before the marker.
    let entry = CreditEntry::new(
        Uuid::new_v4(),
        h.branch_id,
        h.student_id,
        dec(2000),
        "PAY-R2".to_string(),
    );
    h.store.seed_credit_entry(entry).await;
    h.store
        .seed_allocation(prior_allocation(&h, "PAY-R2", None, 2000))
        .await;

    let summary = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(2000),
            "PAY-R2",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect("resume");

    assert_eq!(summary.amount_applied, Decimal::ZERO);
    assert!(summary.credit_created.is_none());

    // Only the seeded record; the resume wrote nothing but the marker.
    assert_eq!(h.store.all_allocations().await.len(), 1);
}

#[tokio::test]
async fn prior_allocations_exceeding_the_payment_are_flagged() {
    let h = TestHarness::new().await;
    let invoice = h
        .seed_invoice(date(2030, 1, 1), date(2030, 1, 15), 9000)
        .await;
    h.store
        .seed_allocation(prior_allocation(&h, "PAY-R3", Some(invoice.invoice_id), 6000))
        .await;

    let err = h
        .engine
        .reconcile(
            h.branch_id,
            h.student_id,
            dec(5000),
            "PAY-R3",
            PaymentMethod::BankTransfer,
            Utc::now(),
        )
        .await
        .expect_err("inconsistent ledger");
    assert!(matches!(
        err,
        FeeError::Overapplication {
            entity: "payment",
            ..
        }
    ));
}
