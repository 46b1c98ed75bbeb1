//! Reconciliation engine: turns one incoming payment into zero or more
//! invoice mutations plus at most one credit ledger entry.
//!
//! Allocation order is oldest billing period first, regardless of which due
//! date is closest. The engine serializes per student, reads the open
//! invoices, computes a write-set with optimistic guards, and hands it to
//! the configured unit of work. Conflicts and partial degraded-mode writes
//! are retried a bounded number of times; retries resume from the
//! allocation records already on disk instead of reapplying from scratch.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::FeeError;
use crate::models::{PaymentMethod, ReconciliationSummary};
use crate::services::locks::StudentLocks;
use crate::services::metrics;
use crate::services::store::{
    FeeStore, InvoiceMutation, NewCreditEntry, ReconciliationWriteSet, TransactionalUnitOfWork,
};

pub struct ReconciliationEngine {
    store: Arc<dyn FeeStore>,
    uow: Arc<dyn TransactionalUnitOfWork>,
    locks: Arc<StudentLocks>,
    max_retries: u32,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn FeeStore>,
        uow: Arc<dyn TransactionalUnitOfWork>,
        locks: Arc<StudentLocks>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            uow,
            locks,
            max_retries,
        }
    }

    /// Reconcile one validated payment event against the student's ledger.
    #[instrument(
        skip(self),
        fields(branch_id = %branch_id, student_id = %student_id, reference = %external_reference, method = %method)
    )]
    pub async fn reconcile(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        amount: Decimal,
        external_reference: &str,
        method: PaymentMethod,
        occurred_at: DateTime<Utc>,
    ) -> Result<ReconciliationSummary, FeeError> {
        if amount <= Decimal::ZERO {
            return Err(FeeError::InvalidAmount(amount));
        }

        // One reconciliation in flight per student; the guard also covers
        // credit application, which shares the same lock map.
        let _guard = self.locks.acquire(student_id).await;

        if !self.store.student_exists(branch_id, student_id).await? {
            return Err(FeeError::StudentNotFound(student_id));
        }

        let mut attempt = 0;
        loop {
            let result = self
                .try_reconcile(
                    branch_id,
                    student_id,
                    amount,
                    external_reference,
                    method,
                    occurred_at,
                )
                .await;

            match result {
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt = attempt,
                        "Reconciliation attempt failed, retrying"
                    );
                    metrics::record_reconciliation("retry");
                }
                Err(e) => {
                    metrics::record_error(match e {
                        FeeError::DuplicateTransaction { .. } => "duplicate_transaction",
                        FeeError::Overapplication { .. } => "overapplication",
                        FeeError::StorageConflict => "storage_conflict",
                        FeeError::PartialFailure { .. } => "partial_failure",
                        _ => "reconciliation",
                    });
                    metrics::record_reconciliation("failure");
                    return Err(e);
                }
                Ok(summary) => {
                    metrics::record_reconciliation("success");
                    info!(
                        amount_applied = %summary.amount_applied,
                        invoices_touched = summary.invoices_touched.len(),
                        credit_created = ?summary.credit_created,
                        "Payment reconciled"
                    );
                    return Ok(summary);
                }
            }
        }
    }

    /// One read-compute-commit pass. Safe to re-run: allocation records
    /// written by an earlier crashed pass count toward the total and their
    /// invoices are skipped.
    async fn try_reconcile(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        amount: Decimal,
        external_reference: &str,
        method: PaymentMethod,
        occurred_at: DateTime<Utc>,
    ) -> Result<ReconciliationSummary, FeeError> {
        if self
            .store
            .marker_exists(branch_id, student_id, external_reference, method)
            .await?
        {
            return Err(FeeError::DuplicateTransaction {
                reference: external_reference.to_string(),
                method: method.as_str().to_string(),
            });
        }

        let prior = self
            .store
            .allocations_for_payment(branch_id, student_id, external_reference, method)
            .await?;
        let prior_invoice_total: Decimal = prior
            .iter()
            .filter(|a| a.invoice_id.is_some())
            .map(|a| a.amount_applied)
            .sum();
        let prior_credit_total: Decimal = prior
            .iter()
            .filter(|a| a.invoice_id.is_none())
            .map(|a| a.amount_applied)
            .sum();
        let prior_invoices: HashSet<Uuid> = prior.iter().filter_map(|a| a.invoice_id).collect();

        let already_allocated = prior_invoice_total + prior_credit_total;
        if already_allocated > amount {
            // Allocation records exceed the payment: the ledger needs a
            // human, not an automatic retry.
            return Err(FeeError::Overapplication {
                entity: "payment",
                id: student_id,
                attempted: already_allocated,
                available: amount,
            });
        }
        let mut remaining = amount - already_allocated;

        let today = occurred_at.date_naive();

        // Records are the source of truth: an invoice whose stored
        // amount_paid lags the sum of its allocation records was caught
        // mid-commit by an earlier interrupted attempt. Bring it up to the
        // recorded total before allocating anything new.
        let mut repairs: Vec<InvoiceMutation> = Vec::new();
        for invoice_id in &prior_invoices {
            let Some(invoice) = self.store.load_invoice(branch_id, *invoice_id).await? else {
                continue;
            };
            let recorded: Decimal = self
                .store
                .allocations_for_invoice(branch_id, *invoice_id)
                .await?
                .iter()
                .map(|a| a.amount_applied)
                .sum();
            if invoice.amount_paid < recorded {
                let mut repaired = invoice.clone();
                repaired.amount_paid = recorded;
                repaired.recompute_status(today);
                warn!(
                    invoice_id = %invoice_id,
                    stored = %invoice.amount_paid,
                    recorded = %recorded,
                    "Invoice lags its allocation records, repairing"
                );
                repairs.push(InvoiceMutation {
                    invoice_id: *invoice_id,
                    expected_amount_paid: invoice.amount_paid,
                    new_amount_paid: recorded,
                    new_status: repaired.parsed_status(),
                    amount_applied: recorded - invoice.amount_paid,
                });
            }
        }

        // Likewise a credit remainder whose record exists but whose ledger
        // entry was never written: re-mint the entry, not the record.
        let credit_repair = if prior_credit_total > Decimal::ZERO
            && self
                .store
                .credit_entry_for_source(branch_id, student_id, external_reference)
                .await?
                .is_none()
        {
            warn!(
                amount = %prior_credit_total,
                "Credit record exists without its ledger entry, repairing"
            );
            Some(NewCreditEntry {
                credit_id: Uuid::new_v4(),
                amount: prior_credit_total,
            })
        } else {
            None
        };

        let mut mutations: Vec<InvoiceMutation> = Vec::new();
        let mut invoices_touched: Vec<Uuid> = prior_invoices.iter().copied().collect();
        let mut applied_now = Decimal::ZERO;

        if remaining > Decimal::ZERO {
            let invoices = self.store.load_open_invoices(branch_id, student_id).await?;
            for mut invoice in invoices {
                if remaining <= Decimal::ZERO {
                    break;
                }
                if prior_invoices.contains(&invoice.invoice_id) {
                    continue;
                }
                let balance = invoice.balance();
                if balance <= Decimal::ZERO {
                    // Stale read: settled between listing and here.
                    continue;
                }
                let to_apply = remaining.min(balance);
                let expected = invoice.amount_paid;
                invoice.apply_amount(to_apply, today)?;
                mutations.push(InvoiceMutation {
                    invoice_id: invoice.invoice_id,
                    expected_amount_paid: expected,
                    new_amount_paid: invoice.amount_paid,
                    new_status: invoice.parsed_status(),
                    amount_applied: to_apply,
                });
                invoices_touched.push(invoice.invoice_id);
                applied_now += to_apply;
                remaining -= to_apply;
            }
        }

        // Whatever the outstanding invoices could not absorb becomes a
        // durable credit, unless an earlier pass already recorded one.
        let credit = if remaining > Decimal::ZERO && prior_credit_total == Decimal::ZERO {
            Some(NewCreditEntry {
                credit_id: Uuid::new_v4(),
                amount: remaining,
            })
        } else {
            None
        };

        let set = ReconciliationWriteSet {
            branch_id,
            student_id,
            external_reference: external_reference.to_string(),
            method,
            amount,
            occurred_at,
            mutations,
            repairs,
            credit,
            credit_repair,
        };
        self.uow.commit_reconciliation(&set).await?;

        metrics::record_allocations("invoice", set.mutations.len() as u64);
        if set.credit.is_some() {
            metrics::record_allocations("credit", 1);
        }

        Ok(ReconciliationSummary {
            external_reference: external_reference.to_string(),
            amount_applied: prior_invoice_total + applied_now,
            invoices_touched,
            credit_created: set
                .credit
                .as_ref()
                .or(set.credit_repair.as_ref())
                .map(|c| c.credit_id),
            already_processed: false,
        })
    }
}
