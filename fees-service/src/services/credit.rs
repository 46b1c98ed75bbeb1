//! Credit application service: drains a student's stored credit into a
//! newly created (or still-open) invoice, oldest credit entry first.
//!
//! Invoice creation calls this immediately after persisting the invoice so
//! no reader ever observes an unpaid invoice while credit was available.
//! Re-running against a settled invoice is a no-op.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::FeeError;
use crate::models::{CreditApplicationOutcome, CreditStatus, PaymentMethod};
use crate::services::locks::StudentLocks;
use crate::services::metrics;
use crate::services::store::{
    CreditDrain, CreditWriteSet, FeeStore, InvoiceMutation, TransactionalUnitOfWork,
};

pub struct CreditApplicationService {
    store: Arc<dyn FeeStore>,
    uow: Arc<dyn TransactionalUnitOfWork>,
    locks: Arc<StudentLocks>,
    max_retries: u32,
}

impl CreditApplicationService {
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

    /// Apply available credit to one invoice, stopping when the invoice is
    /// fully paid or credit runs out, whichever comes first.
    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id, invoice_id = %invoice_id))]
    pub async fn apply_credit_to_invoice(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<CreditApplicationOutcome, FeeError> {
        // Shares the per-student lock with the reconciliation engine so two
        // concurrent invoice creations cannot drain the same credit entry.
        let _guard = self.locks.acquire(student_id).await;

        let mut attempt = 0;
        loop {
            let result = self.try_apply(branch_id, student_id, invoice_id).await;
            match result {
                Err(e) if e.is_retriable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt = attempt, "Credit application failed, retrying");
                    metrics::record_credit_application("retry");
                }
                Err(e) => {
                    metrics::record_credit_application("failure");
                    return Err(e);
                }
                Ok(outcome) => {
                    if outcome.amount_applied > Decimal::ZERO {
                        metrics::record_credit_application("success");
                        info!(
                            amount_applied = %outcome.amount_applied,
                            credits_consumed = outcome.credits_consumed.len(),
                            "Credit applied to invoice"
                        );
                    } else {
                        metrics::record_credit_application("noop");
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    async fn try_apply(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<CreditApplicationOutcome, FeeError> {
        let mut invoice = self
            .store
            .load_invoice(branch_id, invoice_id)
            .await?
            .ok_or(FeeError::InvoiceNotFound(invoice_id))?;
        if invoice.student_id != student_id {
            return Err(FeeError::InvoiceNotFound(invoice_id));
        }

        if !invoice.parsed_status().is_open() {
            // Settled, waived, or cancelled: nothing to drain.
            return Ok(CreditApplicationOutcome {
                invoice_id,
                amount_applied: Decimal::ZERO,
                credits_consumed: Vec::new(),
                invoice_status: invoice.parsed_status(),
            });
        }

        let today = Utc::now().date_naive();
        let expected = invoice.amount_paid;

        // Records are the source of truth: an invoice whose stored
        // amount_paid lags the sum of its allocation records was caught
        // mid-commit by an interrupted earlier attempt. Catch it up first.
        let recorded: Decimal = self
            .store
            .allocations_for_invoice(branch_id, invoice_id)
            .await?
            .iter()
            .map(|a| a.amount_applied)
            .sum();
        if invoice.amount_paid < recorded {
            warn!(
                invoice_id = %invoice_id,
                stored = %invoice.amount_paid,
                recorded = %recorded,
                "Invoice lags its allocation records, repairing"
            );
            invoice.amount_paid = recorded;
            invoice.recompute_status(today);
        }

        let mut drains: Vec<CreditDrain> = Vec::new();
        let mut drain_repairs: Vec<CreditDrain> = Vec::new();
        let mut credits_consumed: Vec<Uuid> = Vec::new();

        for mut entry in self
            .store
            .load_available_credits(branch_id, student_id)
            .await?
        {
            // The entry's true remaining is derived from its drain records;
            // the stored value lags when a drain's record committed but the
            // decrement did not.
            let recorded_drained: Decimal = self
                .store
                .allocations_for_payment(
                    branch_id,
                    student_id,
                    &entry.credit_id.to_string(),
                    PaymentMethod::Credit,
                )
                .await?
                .iter()
                .map(|a| a.amount_applied)
                .sum();
            let true_remaining = entry.amount - recorded_drained;
            if entry.remaining_amount > true_remaining {
                warn!(
                    credit_id = %entry.credit_id,
                    stored = %entry.remaining_amount,
                    recorded = %true_remaining,
                    "Credit entry lags its drain records, repairing"
                );
                let new_status = if true_remaining <= Decimal::ZERO {
                    CreditStatus::Exhausted
                } else {
                    CreditStatus::Available
                };
                drain_repairs.push(CreditDrain {
                    credit_id: entry.credit_id,
                    expected_remaining: entry.remaining_amount,
                    new_remaining: true_remaining,
                    new_status,
                    amount_applied: entry.remaining_amount - true_remaining,
                });
                entry.remaining_amount = true_remaining;
                entry.status = new_status.as_str().to_string();
            }

            let balance = invoice.balance();
            if balance <= Decimal::ZERO {
                // Keep scanning: later entries may still need repair.
                continue;
            }
            let to_apply = entry.remaining_amount.min(balance);
            if to_apply <= Decimal::ZERO {
                continue;
            }
            let expected_remaining = entry.remaining_amount;
            entry.drain(to_apply)?;
            invoice.apply_amount(to_apply, today)?;
            drains.push(CreditDrain {
                credit_id: entry.credit_id,
                expected_remaining,
                new_remaining: entry.remaining_amount,
                new_status: entry.parsed_status(),
                amount_applied: to_apply,
            });
            credits_consumed.push(entry.credit_id);
        }

        let applied = invoice.amount_paid - expected;
        if drains.is_empty() && drain_repairs.is_empty() && applied == Decimal::ZERO {
            return Ok(CreditApplicationOutcome {
                invoice_id,
                amount_applied: Decimal::ZERO,
                credits_consumed: Vec::new(),
                invoice_status: invoice.parsed_status(),
            });
        }

        let new_drain_total: Decimal = drains.iter().map(|d| d.amount_applied).sum();
        let set = CreditWriteSet {
            branch_id,
            student_id,
            mutation: InvoiceMutation {
                invoice_id,
                expected_amount_paid: expected,
                new_amount_paid: invoice.amount_paid,
                new_status: invoice.parsed_status(),
                amount_applied: new_drain_total,
            },
            drains,
            drain_repairs,
        };
        self.uow.commit_credit_application(&set).await?;

        metrics::record_allocations("invoice", set.drains.len() as u64);

        Ok(CreditApplicationOutcome {
            invoice_id,
            amount_applied: applied,
            credits_consumed,
            invoice_status: set.mutation.new_status,
        })
    }
}
