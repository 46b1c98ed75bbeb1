//! Credit ledger entry: student money received in excess of all
//! outstanding obligations, held for future invoices.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::FeeError;

/// Credit entry status. `exhausted` holds exactly when nothing remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Available,
    Exhausted,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Available => "available",
            CreditStatus::Exhausted => "exhausted",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "exhausted" => CreditStatus::Exhausted,
            _ => CreditStatus::Available,
        }
    }
}

impl std::fmt::Display for CreditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A quantum of overpayment. `amount` is the original size and immutable;
/// `remaining_amount` decreases as future invoices consume it. Entries are
/// never deleted, only driven to `exhausted`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditEntry {
    pub credit_id: Uuid,
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub amount: Decimal,
    pub remaining_amount: Decimal,
    pub status: String,
    pub source_reference: String,
    pub created_utc: DateTime<Utc>,
}

impl CreditEntry {
    pub fn new(
        credit_id: Uuid,
        branch_id: Uuid,
        student_id: Uuid,
        amount: Decimal,
        source_reference: String,
    ) -> Self {
        Self {
            credit_id,
            branch_id,
            student_id,
            amount,
            remaining_amount: amount,
            status: CreditStatus::Available.as_str().to_string(),
            source_reference,
            created_utc: Utc::now(),
        }
    }

    pub fn parsed_status(&self) -> CreditStatus {
        CreditStatus::from_string(&self.status)
    }

    /// Consume part of the entry. Draining more than remains is an
    /// invariant violation, rejected rather than truncated.
    pub fn drain(&mut self, amount: Decimal) -> Result<(), FeeError> {
        if amount <= Decimal::ZERO {
            return Err(FeeError::InvalidAmount(amount));
        }
        if amount > self.remaining_amount {
            return Err(FeeError::Overapplication {
                entity: "credit",
                id: self.credit_id,
                attempted: amount,
                available: self.remaining_amount,
            });
        }
        self.remaining_amount -= amount;
        if self.remaining_amount == Decimal::ZERO {
            self.status = CreditStatus::Exhausted.as_str().to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_tracks_remaining_and_flips_to_exhausted_at_zero() {
        let mut entry = CreditEntry::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Decimal::from(3000),
            "PAY-001".to_string(),
        );

        entry.drain(Decimal::from(1000)).unwrap();
        assert_eq!(entry.remaining_amount, Decimal::from(2000));
        assert_eq!(entry.parsed_status(), CreditStatus::Available);

        entry.drain(Decimal::from(2000)).unwrap();
        assert_eq!(entry.remaining_amount, Decimal::ZERO);
        assert_eq!(entry.parsed_status(), CreditStatus::Exhausted);
        // The original amount stays intact for auditing.
        assert_eq!(entry.amount, Decimal::from(3000));
    }

    #[test]
    fn overdraining_is_rejected() {
        let mut entry = CreditEntry::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Decimal::from(500),
            "PAY-002".to_string(),
        );
        let err = entry.drain(Decimal::from(501)).unwrap_err();
        assert!(matches!(err, FeeError::Overapplication { .. }));
        assert_eq!(entry.remaining_amount, Decimal::from(500));
    }
}
