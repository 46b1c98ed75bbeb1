//! HTTP handlers for fees-service.
//!
//! All operations are scoped to the branch from the request context.

pub mod invoices;
pub mod payments;
pub mod students;
