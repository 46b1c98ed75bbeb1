//! Storage seams for the billing core.
//!
//! `FeeStore` covers reads and single-record writes; multi-record commits go
//! through `TransactionalUnitOfWork`, which has two shapes: one backed by a
//! real database transaction, and one backed by ordered resumable single
//! writes for deployments without multi-record atomicity. The engine depends
//! only on the traits and picks up whichever the deployment configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::FeeError;
use crate::models::{
    AllocationRecord, CreditEntry, CreditStatus, Invoice, InvoiceStatus, PaymentMethod,
    PaymentSummary,
};

/// One conditional invoice write. `expected_amount_paid` is the optimistic
/// concurrency guard: the write must fail with a conflict if the stored
/// value has moved since it was read.
#[derive(Debug, Clone)]
pub struct InvoiceMutation {
    pub invoice_id: Uuid,
    pub expected_amount_paid: Decimal,
    pub new_amount_paid: Decimal,
    pub new_status: InvoiceStatus,
    pub amount_applied: Decimal,
}

/// The overpayment remainder of a reconciliation, to be persisted as a new
/// credit ledger entry plus an invoice-less allocation record.
#[derive(Debug, Clone)]
pub struct NewCreditEntry {
    pub credit_id: Uuid,
    pub amount: Decimal,
}

/// Full write-set of one reconciliation attempt.
///
/// Allocation records are the source of truth for recovery: in ordered
/// (non-transactional) mode each record commits before the entity write it
/// describes, and the idempotency marker for `(student, external_reference,
/// method)` is always written last. A crash at any point leaves a ledger
/// the next attempt can finish from the records alone.
///
/// `repairs` and `credit_repair` carry that finishing work: entity writes
/// whose allocation records already exist from an interrupted earlier
/// attempt. They are committed without writing any new record.
#[derive(Debug, Clone)]
pub struct ReconciliationWriteSet {
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub external_reference: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
    pub mutations: Vec<InvoiceMutation>,
    pub repairs: Vec<InvoiceMutation>,
    pub credit: Option<NewCreditEntry>,
    pub credit_repair: Option<NewCreditEntry>,
}

/// One conditional credit-entry write.
#[derive(Debug, Clone)]
pub struct CreditDrain {
    pub credit_id: Uuid,
    pub expected_remaining: Decimal,
    pub new_remaining: Decimal,
    pub new_status: CreditStatus,
    pub amount_applied: Decimal,
}

/// Write-set for draining stored credit into one invoice.
///
/// Same recovery discipline as reconciliation: in ordered mode each drain's
/// allocation record commits before the credit decrement, and the invoice
/// mutation lands last. `drain_repairs` are decrements whose records
/// already exist from an interrupted attempt; they write no new record.
#[derive(Debug, Clone)]
pub struct CreditWriteSet {
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub mutation: InvoiceMutation,
    pub drains: Vec<CreditDrain>,
    pub drain_repairs: Vec<CreditDrain>,
}

/// Record-level reads and writes shared by every backend.
#[async_trait]
pub trait FeeStore: Send + Sync {
    async fn health_check(&self) -> Result<(), FeeError>;

    async fn student_exists(&self, branch_id: Uuid, student_id: Uuid) -> Result<bool, FeeError>;

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), FeeError>;

    async fn load_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, FeeError>;

    /// Open invoices (unpaid, partially paid, overdue) for one student,
    /// oldest billing period first; same-period ties break on creation time
    /// so the order is deterministic and stable.
    async fn load_open_invoices(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<Invoice>, FeeError>;

    /// The credit entry minted from one payment's overpayment remainder,
    /// if it was ever written. Used on resume to tell a recorded-but-unborn
    /// credit apart from one that already exists.
    async fn credit_entry_for_source(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        source_reference: &str,
    ) -> Result<Option<CreditEntry>, FeeError>;

    /// Available credit entries, oldest created first.
    async fn load_available_credits(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<CreditEntry>, FeeError>;

    async fn allocations_for_payment(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<Vec<AllocationRecord>, FeeError>;

    async fn allocations_for_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, FeeError>;

    async fn marker_exists(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<bool, FeeError>;

    /// Administrative transition: forgive an open invoice.
    async fn mark_invoice_waived(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError>;

    /// Administrative transition: cancel an invoice nothing has been paid
    /// against. Invoices with allocations can only be waived.
    async fn mark_invoice_cancelled(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError>;

    /// Sum of `remaining_amount` over available credit entries.
    async fn credit_balance(&self, branch_id: Uuid, student_id: Uuid)
        -> Result<Decimal, FeeError>;

    async fn payment_summary(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<PaymentSummary, FeeError>;
}

/// Commit strategy for multi-record write-sets.
#[async_trait]
pub trait TransactionalUnitOfWork: Send + Sync {
    /// Persist a reconciliation write-set. Implementations must either
    /// commit everything atomically, or apply ordered single writes where
    /// each invoice mutation lands together with its allocation record and
    /// the idempotency marker lands last.
    async fn commit_reconciliation(&self, set: &ReconciliationWriteSet) -> Result<(), FeeError>;

    /// Persist a credit application write-set with the same atomicity
    /// contract: drains and the invoice mutation together, or ordered with
    /// the invoice mutation last.
    async fn commit_credit_application(&self, set: &CreditWriteSet) -> Result<(), FeeError>;
}
