//! Invoice model: one billing obligation for one student for one period.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::FeeError;

/// Invoice lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
    Overdue,
    Waived,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::PartiallyPaid => "partially_paid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Waived => "waived",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partially_paid" => InvoiceStatus::PartiallyPaid,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            "waived" => InvoiceStatus::Waived,
            "cancelled" => InvoiceStatus::Cancelled,
            _ => InvoiceStatus::Unpaid,
        }
    }

    /// Statuses a payment can still be allocated against.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Unpaid | InvoiceStatus::PartiallyPaid | InvoiceStatus::Overdue
        )
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice document. The status column holds the string form; the derived
/// balance is never stored, always recomputed from the amount columns.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub period_start: NaiveDate,
    pub due_date: NaiveDate,
    pub total_amount_due: Decimal,
    pub amount_paid: Decimal,
    pub discount_amount: Decimal,
    pub scholarship_amount: Decimal,
    pub status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating an invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub period_start: NaiveDate,
    pub due_date: NaiveDate,
    pub total_amount_due: Decimal,
    pub discount_amount: Decimal,
    pub scholarship_amount: Decimal,
}

impl Invoice {
    /// Build a fresh invoice with nothing paid. Status is derived
    /// immediately so an already-late invoice starts out `overdue`.
    pub fn new(input: CreateInvoice, today: NaiveDate) -> Self {
        let now = Utc::now();
        let mut invoice = Self {
            invoice_id: Uuid::new_v4(),
            branch_id: input.branch_id,
            student_id: input.student_id,
            period_start: input.period_start,
            due_date: input.due_date,
            total_amount_due: input.total_amount_due,
            amount_paid: Decimal::ZERO,
            discount_amount: input.discount_amount,
            scholarship_amount: input.scholarship_amount,
            status: InvoiceStatus::Unpaid.as_str().to_string(),
            created_utc: now,
            updated_utc: now,
        };
        invoice.recompute_status(today);
        invoice
    }

    pub fn parsed_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// Remaining cash obligation. Discount and scholarship are non-cash
    /// reductions fixed at creation/scholarship time, so they reduce what a
    /// payment is expected to cover.
    pub fn balance(&self) -> Decimal {
        self.total_amount_due - self.amount_paid - self.discount_amount - self.scholarship_amount
    }

    /// Apply a positive payment portion to this invoice.
    ///
    /// The caller (reconciliation engine or credit application) must clamp
    /// to the current balance first; pushing more than the balance is an
    /// invariant violation and is rejected, never truncated.
    pub fn apply_amount(&mut self, amount: Decimal, today: NaiveDate) -> Result<(), FeeError> {
        if amount <= Decimal::ZERO {
            return Err(FeeError::InvalidAmount(amount));
        }
        let balance = self.balance();
        if amount > balance {
            return Err(FeeError::Overapplication {
                entity: "invoice",
                id: self.invoice_id,
                attempted: amount,
                available: balance,
            });
        }
        self.amount_paid += amount;
        self.updated_utc = Utc::now();
        self.recompute_status(today);
        Ok(())
    }

    /// Recompute the derived status. Administrative states (waived,
    /// cancelled) are terminal and never recomputed away.
    pub fn recompute_status(&mut self, today: NaiveDate) {
        if !self.parsed_status().is_open() {
            return;
        }
        let next = if self.balance() <= Decimal::ZERO {
            InvoiceStatus::Paid
        } else if self.amount_paid > Decimal::ZERO {
            InvoiceStatus::PartiallyPaid
        } else if self.due_date < today {
            InvoiceStatus::Overdue
        } else {
            InvoiceStatus::Unpaid
        };
        self.status = next.as_str().to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_invoice(total: i64) -> Invoice {
        Invoice::new(
            CreateInvoice {
                branch_id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                period_start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                due_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
                total_amount_due: Decimal::from(total),
                discount_amount: Decimal::ZERO,
                scholarship_amount: Decimal::ZERO,
            },
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
        )
    }

    #[test]
    fn partial_then_full_payment_walks_the_status_machine() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let mut invoice = base_invoice(5000);
        assert_eq!(invoice.parsed_status(), InvoiceStatus::Unpaid);

        invoice.apply_amount(Decimal::from(2000), today).unwrap();
        assert_eq!(invoice.parsed_status(), InvoiceStatus::PartiallyPaid);
        assert_eq!(invoice.balance(), Decimal::from(3000));

        invoice.apply_amount(Decimal::from(3000), today).unwrap();
        assert_eq!(invoice.parsed_status(), InvoiceStatus::Paid);
        assert_eq!(invoice.balance(), Decimal::ZERO);
    }

    #[test]
    fn overapplication_is_rejected_not_clamped() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let mut invoice = base_invoice(1000);
        let err = invoice
            .apply_amount(Decimal::from(1001), today)
            .unwrap_err();
        assert!(matches!(err, FeeError::Overapplication { .. }));
        // Nothing was applied.
        assert_eq!(invoice.amount_paid, Decimal::ZERO);
        assert_eq!(invoice.parsed_status(), InvoiceStatus::Unpaid);
    }

    #[test]
    fn discount_and_scholarship_reduce_the_cash_balance() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let mut invoice = base_invoice(10000);
        invoice.discount_amount = Decimal::from(1500);
        invoice.scholarship_amount = Decimal::from(2500);
        assert_eq!(invoice.balance(), Decimal::from(6000));

        // Paying the cash balance settles the invoice in full.
        invoice.apply_amount(Decimal::from(6000), today).unwrap();
        assert_eq!(invoice.parsed_status(), InvoiceStatus::Paid);
        assert_eq!(
            invoice.total_amount_due,
            invoice.amount_paid + invoice.discount_amount + invoice.scholarship_amount
        );
    }

    #[test]
    fn past_due_unpaid_invoice_reads_overdue_but_partial_payment_wins() {
        let past_due = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        let mut invoice = base_invoice(4000);
        invoice.recompute_status(past_due);
        assert_eq!(invoice.parsed_status(), InvoiceStatus::Overdue);

        invoice.apply_amount(Decimal::from(100), past_due).unwrap();
        assert_eq!(invoice.parsed_status(), InvoiceStatus::PartiallyPaid);
    }

    #[test]
    fn zero_and_negative_amounts_are_invalid() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let mut invoice = base_invoice(1000);
        assert!(matches!(
            invoice.apply_amount(Decimal::ZERO, today),
            Err(FeeError::InvalidAmount(_))
        ));
        assert!(matches!(
            invoice.apply_amount(Decimal::from(-5), today),
            Err(FeeError::InvalidAmount(_))
        ));
    }
}
