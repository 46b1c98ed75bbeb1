//! Allocation record: immutable audit entry linking a payment amount to a
//! specific invoice, or to credit when `invoice_id` is null.
//!
//! Splitting a payment across invoices emits multiple records under the one
//! unchanged payment reference; references are never re-numbered or
//! suffixed to represent a split.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AllocationRecord {
    pub allocation_id: Uuid,
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub payment_reference: String,
    pub payment_method: String,
    pub invoice_id: Option<Uuid>,
    pub amount_applied: Decimal,
    pub applied_utc: DateTime<Utc>,
}
