//! Business logic services for fees-service.

pub mod credit;
pub mod database;
pub mod locks;
pub mod memory;
pub mod metrics;
pub mod reconciliation;
pub mod store;

pub use credit::CreditApplicationService;
pub use database::{Database, PgAtomicUnitOfWork, PgOrderedUnitOfWork};
pub use locks::StudentLocks;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::ReconciliationEngine;
pub use store::{FeeStore, TransactionalUnitOfWork};
