//! Request and response payloads for the HTTP surface.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CreditApplicationOutcome, Invoice, PaymentMethod};

#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    pub student_id: Uuid,
    pub period_start: NaiveDate,
    pub due_date: NaiveDate,
    pub total_amount_due: Decimal,
    #[serde(default)]
    pub discount_amount: Decimal,
    #[serde(default)]
    pub scholarship_amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct CreateInvoiceResponse {
    pub invoice: Invoice,
    /// Present when stored credit was drained into the new invoice at
    /// creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credit_applied: Option<CreditApplicationOutcome>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub student_id: Uuid,
    pub amount: Decimal,
    pub external_reference: String,
    pub method: PaymentMethod,
    /// Provider-side timestamp of the payment. Defaults to now.
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyCreditRequest {
    pub student_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CreditBalanceResponse {
    pub student_id: Uuid,
    pub credit_balance: Decimal,
}
