//! Domain error taxonomy for the billing core.

use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum FeeError {
    /// The external reference has already been fully reconciled. Callers
    /// facing a webhook sender must report this as success-already-applied,
    /// never as a failure, or the sender will retry forever.
    #[error("payment {reference} via {method} has already been processed")]
    DuplicateTransaction { reference: String, method: String },

    /// Internal invariant violation: more money pushed at a record than it
    /// can absorb. Never clamped silently; the ledger must stay auditable.
    #[error("overapplication on {entity} {id}: attempted {attempted}, available {available}")]
    Overapplication {
        entity: &'static str,
        id: Uuid,
        attempted: Decimal,
        available: Decimal,
    },

    #[error("student {0} not found")]
    StudentNotFound(Uuid),

    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("invoice {invoice_id} cannot move from {from} to {to}")]
    InvalidTransition {
        invoice_id: Uuid,
        from: String,
        to: &'static str,
    },

    #[error("payment amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    /// A conditional write lost an optimistic-concurrency race. Recoverable:
    /// the engine re-reads and retries the whole operation.
    #[error("concurrent ledger update detected")]
    StorageConflict,

    /// Ordered (non-transactional) commit failed partway. Recoverable on
    /// retry: allocation records already written are skipped, not reapplied.
    #[error("partial write for payment {reference}: {source}")]
    PartialFailure {
        reference: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl FeeError {
    /// Errors the engine retries (bounded) before surfacing.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FeeError::StorageConflict | FeeError::PartialFailure { .. }
        )
    }
}

impl From<FeeError> for AppError {
    fn from(err: FeeError) -> Self {
        match err {
            FeeError::DuplicateTransaction { .. } => AppError::Conflict(anyhow::anyhow!("{err}")),
            FeeError::StudentNotFound(_) | FeeError::InvoiceNotFound(_) => {
                AppError::NotFound(anyhow::anyhow!("{err}"))
            }
            FeeError::InvalidAmount(_) => AppError::BadRequest(anyhow::anyhow!("{err}")),
            FeeError::InvalidTransition { .. } => AppError::Conflict(anyhow::anyhow!("{err}")),
            FeeError::Overapplication { .. }
            | FeeError::StorageConflict
            | FeeError::PartialFailure { .. } => AppError::InternalError(anyhow::anyhow!("{err}")),
            FeeError::Storage(e) => AppError::DatabaseError(e),
        }
    }
}
