//! Data models for fees-service.

mod allocation;
mod credit;
mod invoice;
mod payment;

pub use allocation::AllocationRecord;
pub use credit::{CreditEntry, CreditStatus};
pub use invoice::{CreateInvoice, Invoice, InvoiceStatus};
pub use payment::{
    CreditApplicationOutcome, InvoiceStatusCounts, PaymentMethod, PaymentSummary,
    ReconciliationSummary,
};
