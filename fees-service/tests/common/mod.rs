//! Shared harness for engine-level tests, running against the in-memory
//! backend so no infrastructure is required.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use fees_service::models::{CreateInvoice, Invoice};
use fees_service::services::{
    CreditApplicationService, FeeStore, MemoryStore, ReconciliationEngine, StudentLocks,
};

pub struct TestHarness {
    pub branch_id: Uuid,
    pub student_id: Uuid,
    pub store: Arc<MemoryStore>,
    pub engine: ReconciliationEngine,
    pub credit: CreditApplicationService,
}

impl TestHarness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(StudentLocks::new());
        let branch_id = Uuid::new_v4();
        let student_id = Uuid::new_v4();
        store.register_student(branch_id, student_id).await;

        let engine = ReconciliationEngine::new(store.clone(), store.clone(), locks.clone(), 3);
        let credit = CreditApplicationService::new(store.clone(), store.clone(), locks, 3);

        Self {
            branch_id,
            student_id,
            store,
            engine,
            credit,
        }
    }

    /// Insert an unpaid invoice for the harness student.
    pub async fn seed_invoice(
        &self,
        period_start: NaiveDate,
        due_date: NaiveDate,
        total: i64,
    ) -> Invoice {
        let invoice = Invoice::new(
            CreateInvoice {
                branch_id: self.branch_id,
                student_id: self.student_id,
                period_start,
                due_date,
                total_amount_due: Decimal::from(total),
                discount_amount: Decimal::ZERO,
                scholarship_amount: Decimal::ZERO,
            },
            period_start,
        );
        self.store
            .insert_invoice(&invoice)
            .await
            .expect("insert invoice");
        invoice
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Invoice {
        self.store
            .load_invoice(self.branch_id, invoice_id)
            .await
            .expect("load invoice")
            .expect("invoice exists")
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn dec(n: i64) -> Decimal {
    Decimal::from(n)
}
