//! In-memory storage backend.
//!
//! Serves two purposes: a volatile backend for single-node and development
//! deployments, and the hermetic substrate for the engine's tests. Commits
//! run under one write lock, so the unit-of-work here is genuinely atomic;
//! the optimistic guards are still enforced to keep the conflict paths
//! honest.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::FeeError;
use crate::models::{
    AllocationRecord, CreditEntry, Invoice, InvoiceStatus, InvoiceStatusCounts, PaymentMethod,
    PaymentSummary,
};
use crate::services::store::{
    CreditWriteSet, FeeStore, ReconciliationWriteSet, TransactionalUnitOfWork,
};

#[derive(Default)]
struct MemoryState {
    students: HashSet<(Uuid, Uuid)>,
    invoices: HashMap<Uuid, Invoice>,
    credits: HashMap<Uuid, CreditEntry>,
    allocations: Vec<AllocationRecord>,
    markers: HashSet<(Uuid, Uuid, String, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a student known to the store. The Postgres backend reads the
    /// collaborator-owned students table instead.
    pub async fn register_student(&self, branch_id: Uuid, student_id: Uuid) {
        let mut state = self.state.write().await;
        state.students.insert((branch_id, student_id));
    }

    /// Insert a raw allocation record, bypassing the unit of work. Used to
    /// reconstruct mid-crash ledger states when exercising resumability.
    pub async fn seed_allocation(&self, record: AllocationRecord) {
        let mut state = self.state.write().await;
        state.allocations.push(record);
    }

    /// Insert a raw credit entry, bypassing the unit of work. Same purpose
    /// as [`seed_allocation`](Self::seed_allocation).
    pub async fn seed_credit_entry(&self, entry: CreditEntry) {
        let mut state = self.state.write().await;
        state.credits.insert(entry.credit_id, entry);
    }

    /// Snapshot of every allocation record, in write order.
    pub async fn all_allocations(&self) -> Vec<AllocationRecord> {
        self.state.read().await.allocations.clone()
    }

    pub async fn get_credit(&self, credit_id: Uuid) -> Option<CreditEntry> {
        self.state.read().await.credits.get(&credit_id).cloned()
    }
}

#[async_trait]
impl FeeStore for MemoryStore {
    async fn health_check(&self) -> Result<(), FeeError> {
        Ok(())
    }

    async fn student_exists(&self, branch_id: Uuid, student_id: Uuid) -> Result<bool, FeeError> {
        let state = self.state.read().await;
        Ok(state.students.contains(&(branch_id, student_id)))
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), FeeError> {
        let mut state = self.state.write().await;
        // A billed student is by definition known to this backend.
        state
            .students
            .insert((invoice.branch_id, invoice.student_id));
        state.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn load_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, FeeError> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|i| i.branch_id == branch_id)
            .cloned())
    }

    async fn load_open_invoices(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<Invoice>, FeeError> {
        let state = self.state.read().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                i.branch_id == branch_id
                    && i.student_id == student_id
                    && i.parsed_status().is_open()
            })
            .cloned()
            .collect();
        invoices.sort_by(|a, b| {
            a.period_start
                .cmp(&b.period_start)
                .then(a.created_utc.cmp(&b.created_utc))
        });
        Ok(invoices)
    }

    async fn credit_entry_for_source(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        source_reference: &str,
    ) -> Result<Option<CreditEntry>, FeeError> {
        let state = self.state.read().await;
        Ok(state
            .credits
            .values()
            .find(|c| {
                c.branch_id == branch_id
                    && c.student_id == student_id
                    && c.source_reference == source_reference
            })
            .cloned())
    }

    async fn load_available_credits(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<CreditEntry>, FeeError> {
        let state = self.state.read().await;
        let mut credits: Vec<CreditEntry> = state
            .credits
            .values()
            .filter(|c| {
                c.branch_id == branch_id
                    && c.student_id == student_id
                    && c.remaining_amount > Decimal::ZERO
            })
            .cloned()
            .collect();
        credits.sort_by(|a, b| a.created_utc.cmp(&b.created_utc));
        Ok(credits)
    }

    async fn allocations_for_payment(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<Vec<AllocationRecord>, FeeError> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .iter()
            .filter(|a| {
                a.branch_id == branch_id
                    && a.student_id == student_id
                    && a.payment_reference == reference
                    && a.payment_method == method.as_str()
            })
            .cloned()
            .collect())
    }

    async fn allocations_for_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, FeeError> {
        let state = self.state.read().await;
        Ok(state
            .allocations
            .iter()
            .filter(|a| a.branch_id == branch_id && a.invoice_id == Some(invoice_id))
            .cloned()
            .collect())
    }

    async fn marker_exists(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<bool, FeeError> {
        let state = self.state.read().await;
        Ok(state.markers.contains(&(
            branch_id,
            student_id,
            reference.to_string(),
            method.as_str().to_string(),
        )))
    }

    async fn mark_invoice_waived(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .filter(|i| i.branch_id == branch_id)
            .ok_or(FeeError::InvoiceNotFound(invoice_id))?;
        if !invoice.parsed_status().is_open() {
            return Err(FeeError::InvalidTransition {
                invoice_id,
                from: invoice.status.clone(),
                to: "waived",
            });
        }
        invoice.status = InvoiceStatus::Waived.as_str().to_string();
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn mark_invoice_cancelled(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError> {
        let mut state = self.state.write().await;
        let invoice = state
            .invoices
            .get_mut(&invoice_id)
            .filter(|i| i.branch_id == branch_id)
            .ok_or(FeeError::InvoiceNotFound(invoice_id))?;
        if !invoice.parsed_status().is_open() || invoice.amount_paid > Decimal::ZERO {
            return Err(FeeError::InvalidTransition {
                invoice_id,
                from: invoice.status.clone(),
                to: "cancelled",
            });
        }
        invoice.status = InvoiceStatus::Cancelled.as_str().to_string();
        invoice.updated_utc = Utc::now();
        Ok(invoice.clone())
    }

    async fn credit_balance(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Decimal, FeeError> {
        let state = self.state.read().await;
        Ok(state
            .credits
            .values()
            .filter(|c| c.branch_id == branch_id && c.student_id == student_id)
            .map(|c| c.remaining_amount)
            .sum())
    }

    async fn payment_summary(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<PaymentSummary, FeeError> {
        let state = self.state.read().await;
        let mut counts = InvoiceStatusCounts::default();
        let mut total_expected = Decimal::ZERO;
        let mut total_paid = Decimal::ZERO;

        for invoice in state
            .invoices
            .values()
            .filter(|i| i.branch_id == branch_id && i.student_id == student_id)
        {
            let status = invoice.parsed_status();
            match status {
                InvoiceStatus::Unpaid => counts.unpaid += 1,
                InvoiceStatus::PartiallyPaid => counts.partially_paid += 1,
                InvoiceStatus::Paid => counts.paid += 1,
                InvoiceStatus::Overdue => counts.overdue += 1,
                InvoiceStatus::Waived => counts.waived += 1,
                InvoiceStatus::Cancelled => counts.cancelled += 1,
            }
            if status.is_open() || status == InvoiceStatus::Paid {
                total_expected += invoice.total_amount_due
                    - invoice.discount_amount
                    - invoice.scholarship_amount;
                total_paid += invoice.amount_paid;
            }
        }

        let credit_balance = state
            .credits
            .values()
            .filter(|c| c.branch_id == branch_id && c.student_id == student_id)
            .map(|c| c.remaining_amount)
            .sum();

        Ok(PaymentSummary {
            total_expected,
            total_paid,
            total_balance: total_expected - total_paid,
            credit_balance,
            invoice_counts: counts,
        })
    }
}

#[async_trait]
impl TransactionalUnitOfWork for MemoryStore {
    async fn commit_reconciliation(&self, set: &ReconciliationWriteSet) -> Result<(), FeeError> {
        let mut state = self.state.write().await;

        let marker_key = (
            set.branch_id,
            set.student_id,
            set.external_reference.clone(),
            set.method.as_str().to_string(),
        );
        if state.markers.contains(&marker_key) {
            return Err(FeeError::DuplicateTransaction {
                reference: set.external_reference.clone(),
                method: set.method.as_str().to_string(),
            });
        }

        // Validate every optimistic guard before touching anything, so the
        // commit is all-or-nothing. Repairs and fresh mutations target
        // disjoint invoices, so both validate against stored state.
        for mutation in set.mutations.iter().chain(&set.repairs) {
            let invoice = state
                .invoices
                .get(&mutation.invoice_id)
                .ok_or(FeeError::InvoiceNotFound(mutation.invoice_id))?;
            if invoice.amount_paid != mutation.expected_amount_paid {
                return Err(FeeError::StorageConflict);
            }
        }

        let now = Utc::now();
        for repair in &set.repairs {
            if let Some(invoice) = state.invoices.get_mut(&repair.invoice_id) {
                invoice.amount_paid = repair.new_amount_paid;
                invoice.status = repair.new_status.as_str().to_string();
                invoice.updated_utc = now;
            }
        }
        for mutation in &set.mutations {
            if let Some(invoice) = state.invoices.get_mut(&mutation.invoice_id) {
                invoice.amount_paid = mutation.new_amount_paid;
                invoice.status = mutation.new_status.as_str().to_string();
                invoice.updated_utc = now;
            }
            state.allocations.push(AllocationRecord {
                allocation_id: Uuid::new_v4(),
                branch_id: set.branch_id,
                student_id: set.student_id,
                payment_reference: set.external_reference.clone(),
                payment_method: set.method.as_str().to_string(),
                invoice_id: Some(mutation.invoice_id),
                amount_applied: mutation.amount_applied,
                applied_utc: now,
            });
        }

        if let Some(credit) = &set.credit {
            state.credits.insert(
                credit.credit_id,
                CreditEntry::new(
                    credit.credit_id,
                    set.branch_id,
                    set.student_id,
                    credit.amount,
                    set.external_reference.clone(),
                ),
            );
            state.allocations.push(AllocationRecord {
                allocation_id: Uuid::new_v4(),
                branch_id: set.branch_id,
                student_id: set.student_id,
                payment_reference: set.external_reference.clone(),
                payment_method: set.method.as_str().to_string(),
                invoice_id: None,
                amount_applied: credit.amount,
                applied_utc: now,
            });
        }

        // A repaired credit re-mints the entry; its record already exists.
        if let Some(credit) = &set.credit_repair {
            state.credits.insert(
                credit.credit_id,
                CreditEntry::new(
                    credit.credit_id,
                    set.branch_id,
                    set.student_id,
                    credit.amount,
                    set.external_reference.clone(),
                ),
            );
        }

        state.markers.insert(marker_key);
        Ok(())
    }

    async fn commit_credit_application(&self, set: &CreditWriteSet) -> Result<(), FeeError> {
        let mut state = self.state.write().await;

        let invoice = state
            .invoices
            .get(&set.mutation.invoice_id)
            .ok_or(FeeError::InvoiceNotFound(set.mutation.invoice_id))?;
        if invoice.amount_paid != set.mutation.expected_amount_paid {
            return Err(FeeError::StorageConflict);
        }
        // A fresh drain of a just-repaired entry guards against the
        // post-repair value, so validation tracks the effective remaining
        // per entry instead of the stored one.
        let mut effective: HashMap<Uuid, Decimal> = HashMap::new();
        for drain in set.drain_repairs.iter().chain(&set.drains) {
            let stored = match effective.get(&drain.credit_id) {
                Some(remaining) => *remaining,
                None => {
                    state
                        .credits
                        .get(&drain.credit_id)
                        .ok_or_else(|| {
                            FeeError::Storage(anyhow::anyhow!("credit entry vanished"))
                        })?
                        .remaining_amount
                }
            };
            if stored != drain.expected_remaining {
                return Err(FeeError::StorageConflict);
            }
            effective.insert(drain.credit_id, drain.new_remaining);
        }

        let now = Utc::now();
        for repair in &set.drain_repairs {
            if let Some(credit) = state.credits.get_mut(&repair.credit_id) {
                credit.remaining_amount = repair.new_remaining;
                credit.status = repair.new_status.as_str().to_string();
            }
        }
        for drain in &set.drains {
            if let Some(credit) = state.credits.get_mut(&drain.credit_id) {
                credit.remaining_amount = drain.new_remaining;
                credit.status = drain.new_status.as_str().to_string();
            }
            state.allocations.push(AllocationRecord {
                allocation_id: Uuid::new_v4(),
                branch_id: set.branch_id,
                student_id: set.student_id,
                payment_reference: drain.credit_id.to_string(),
                payment_method: PaymentMethod::Credit.as_str().to_string(),
                invoice_id: Some(set.mutation.invoice_id),
                amount_applied: drain.amount_applied,
                applied_utc: now,
            });
        }
        if let Some(invoice) = state.invoices.get_mut(&set.mutation.invoice_id) {
            invoice.amount_paid = set.mutation.new_amount_paid;
            invoice.status = set.mutation.new_status.as_str().to_string();
            invoice.updated_utc = now;
        }
        Ok(())
    }
}
