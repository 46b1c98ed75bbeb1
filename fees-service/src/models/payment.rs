//! Payment-side types: methods, reconciliation results, and summaries.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::InvoiceStatus;

/// How a payment reached us. Idempotency is keyed per (reference, method)
/// because two providers can reuse the same reference numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    MobileMoney,
    Card,
    Cash,
    /// Internal method for allocations written when stored credit is
    /// drained into a new invoice.
    Credit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::Card => "card",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Credit => "credit",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "bank_transfer" => PaymentMethod::BankTransfer,
            "mobile_money" => PaymentMethod::MobileMoney,
            "card" => PaymentMethod::Card,
            "credit" => PaymentMethod::Credit,
            _ => PaymentMethod::Cash,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one reconciliation call.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub external_reference: String,
    /// Portion of the payment applied to invoices (any credited remainder
    /// is reported via `credit_created`).
    pub amount_applied: Decimal,
    pub invoices_touched: Vec<Uuid>,
    pub credit_created: Option<Uuid>,
    /// True when the reference had already been fully processed and this
    /// call changed nothing.
    pub already_processed: bool,
}

/// Outcome of draining stored credit into one invoice.
#[derive(Debug, Clone, Serialize)]
pub struct CreditApplicationOutcome {
    pub invoice_id: Uuid,
    pub amount_applied: Decimal,
    pub credits_consumed: Vec<Uuid>,
    pub invoice_status: InvoiceStatus,
}

/// Invoice counts by status for one student.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvoiceStatusCounts {
    pub unpaid: i64,
    pub partially_paid: i64,
    pub paid: i64,
    pub overdue: i64,
    pub waived: i64,
    pub cancelled: i64,
}

/// Aggregate payment position for one student. Waived and cancelled
/// invoices are excluded from the money totals; they appear only in the
/// per-status counts.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentSummary {
    pub total_expected: Decimal,
    pub total_paid: Decimal,
    pub total_balance: Decimal,
    pub credit_balance: Decimal,
    pub invoice_counts: InvoiceStatusCounts,
}
