//! PostgreSQL storage backend for fees-service.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::FeeError;
use crate::models::{
    AllocationRecord, CreditEntry, Invoice, InvoiceStatus, InvoiceStatusCounts, PaymentMethod,
    PaymentSummary,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    CreditWriteSet, FeeStore, InvoiceMutation, ReconciliationWriteSet, TransactionalUnitOfWork,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fees-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, FeeError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), FeeError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// Apply one guarded invoice update. The `amount_paid` predicate is the
/// optimistic lock: zero rows updated means someone moved the invoice
/// underneath us.
async fn apply_invoice_mutation(
    conn: &mut PgConnection,
    branch_id: Uuid,
    mutation: &InvoiceMutation,
) -> Result<(), FeeError> {
    let result = sqlx::query(
        r#"
        UPDATE invoices
        SET amount_paid = $1, status = $2, updated_utc = NOW()
        WHERE branch_id = $3 AND invoice_id = $4 AND amount_paid = $5
        "#,
    )
    .bind(mutation.new_amount_paid)
    .bind(mutation.new_status.as_str())
    .bind(branch_id)
    .bind(mutation.invoice_id)
    .bind(mutation.expected_amount_paid)
    .execute(&mut *conn)
    .await
    .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to update invoice: {}", e)))?;

    if result.rows_affected() != 1 {
        return Err(FeeError::StorageConflict);
    }
    Ok(())
}

async fn insert_allocation(
    conn: &mut PgConnection,
    branch_id: Uuid,
    student_id: Uuid,
    payment_reference: &str,
    method: &str,
    invoice_id: Option<Uuid>,
    amount_applied: Decimal,
) -> Result<(), FeeError> {
    sqlx::query(
        r#"
        INSERT INTO allocation_records
            (allocation_id, branch_id, student_id, payment_reference, payment_method,
             invoice_id, amount_applied, applied_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(branch_id)
    .bind(student_id)
    .bind(payment_reference)
    .bind(method)
    .bind(invoice_id)
    .bind(amount_applied)
    .execute(&mut *conn)
    .await
    .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to record allocation: {}", e)))?;
    Ok(())
}

async fn insert_credit(
    conn: &mut PgConnection,
    branch_id: Uuid,
    student_id: Uuid,
    credit_id: Uuid,
    amount: Decimal,
    source_reference: &str,
) -> Result<(), FeeError> {
    sqlx::query(
        r#"
        INSERT INTO credit_entries
            (credit_id, branch_id, student_id, amount, remaining_amount, status,
             source_reference, created_utc)
        VALUES ($1, $2, $3, $4, $4, 'available', $5, NOW())
        "#,
    )
    .bind(credit_id)
    .bind(branch_id)
    .bind(student_id)
    .bind(amount)
    .bind(source_reference)
    .execute(&mut *conn)
    .await
    .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to create credit entry: {}", e)))?;
    Ok(())
}

/// Insert the processed-payment marker. Returns false when the marker was
/// already present.
async fn insert_marker(
    conn: &mut PgConnection,
    set: &ReconciliationWriteSet,
) -> Result<bool, FeeError> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_payments
            (branch_id, student_id, external_reference, payment_method, amount, occurred_utc, processed_utc)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (branch_id, student_id, external_reference, payment_method) DO NOTHING
        "#,
    )
    .bind(set.branch_id)
    .bind(set.student_id)
    .bind(&set.external_reference)
    .bind(set.method.as_str())
    .bind(set.amount)
    .bind(set.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to insert payment marker: {}", e)))?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl FeeStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), FeeError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id))]
    async fn student_exists(&self, branch_id: Uuid, student_id: Uuid) -> Result<bool, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["student_exists"])
            .start_timer();

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM students WHERE branch_id = $1 AND student_id = $2)",
        )
        .bind(branch_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to look up student: {}", e)))?;

        timer.observe_duration();
        Ok(exists)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices
                (invoice_id, branch_id, student_id, period_start, due_date,
                 total_amount_due, amount_paid, discount_amount, scholarship_amount,
                 status, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.branch_id)
        .bind(invoice.student_id)
        .bind(invoice.period_start)
        .bind(invoice.due_date)
        .bind(invoice.total_amount_due)
        .bind(invoice.amount_paid)
        .bind(invoice.discount_amount)
        .bind(invoice.scholarship_amount)
        .bind(&invoice.status)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        timer.observe_duration();
        info!(invoice_id = %invoice.invoice_id, "Invoice created");
        Ok(())
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, invoice_id = %invoice_id))]
    async fn load_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE branch_id = $1 AND invoice_id = $2",
        )
        .bind(branch_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load invoice: {}", e)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id))]
    async fn load_open_invoices(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<Invoice>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_open_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE branch_id = $1 AND student_id = $2
              AND status IN ('unpaid', 'partially_paid', 'overdue')
            ORDER BY period_start ASC, created_utc ASC
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load open invoices: {}", e)))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, reference = %source_reference))]
    async fn credit_entry_for_source(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        source_reference: &str,
    ) -> Result<Option<CreditEntry>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["credit_entry_for_source"])
            .start_timer();

        let entry = sqlx::query_as::<_, CreditEntry>(
            r#"
            SELECT * FROM credit_entries
            WHERE branch_id = $1 AND student_id = $2 AND source_reference = $3
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .bind(source_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load credit entry: {}", e)))?;

        timer.observe_duration();
        Ok(entry)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id))]
    async fn load_available_credits(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<CreditEntry>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_available_credits"])
            .start_timer();

        let credits = sqlx::query_as::<_, CreditEntry>(
            r#"
            SELECT * FROM credit_entries
            WHERE branch_id = $1 AND student_id = $2
              AND status = 'available' AND remaining_amount > 0
            ORDER BY created_utc ASC
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load credits: {}", e)))?;

        timer.observe_duration();
        Ok(credits)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, reference = %reference))]
    async fn allocations_for_payment(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<Vec<AllocationRecord>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocations_for_payment"])
            .start_timer();

        let records = sqlx::query_as::<_, AllocationRecord>(
            r#"
            SELECT * FROM allocation_records
            WHERE branch_id = $1 AND student_id = $2
              AND payment_reference = $3 AND payment_method = $4
            ORDER BY applied_utc ASC
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .bind(reference)
        .bind(method.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load allocations: {}", e)))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, invoice_id = %invoice_id))]
    async fn allocations_for_invoice(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocations_for_invoice"])
            .start_timer();

        let records = sqlx::query_as::<_, AllocationRecord>(
            r#"
            SELECT * FROM allocation_records
            WHERE branch_id = $1 AND invoice_id = $2
            ORDER BY applied_utc ASC
            "#,
        )
        .bind(branch_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load allocations: {}", e)))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, reference = %reference))]
    async fn marker_exists(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
        reference: &str,
        method: PaymentMethod,
    ) -> Result<bool, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["marker_exists"])
            .start_timer();

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_payments
                WHERE branch_id = $1 AND student_id = $2
                  AND external_reference = $3 AND payment_method = $4
            )
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .bind(reference)
        .bind(method.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to check payment marker: {}", e)))?;

        timer.observe_duration();
        Ok(exists)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, invoice_id = %invoice_id))]
    async fn mark_invoice_waived(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_waived"])
            .start_timer();

        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'waived', updated_utc = NOW()
            WHERE branch_id = $1 AND invoice_id = $2
              AND status IN ('unpaid', 'partially_paid', 'overdue')
            RETURNING *
            "#,
        )
        .bind(branch_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to waive invoice: {}", e)))?;

        timer.observe_duration();

        match updated {
            Some(invoice) => {
                info!(invoice_id = %invoice_id, "Invoice waived");
                Ok(invoice)
            }
            None => match self.load_invoice(branch_id, invoice_id).await? {
                Some(invoice) => Err(FeeError::InvalidTransition {
                    invoice_id,
                    from: invoice.status,
                    to: "waived",
                }),
                None => Err(FeeError::InvoiceNotFound(invoice_id)),
            },
        }
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, invoice_id = %invoice_id))]
    async fn mark_invoice_cancelled(
        &self,
        branch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_cancelled"])
            .start_timer();

        // Cancellation is only legal before any money has landed on the
        // invoice; waive is the path for forgiving a partially paid one.
        let updated = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = 'cancelled', updated_utc = NOW()
            WHERE branch_id = $1 AND invoice_id = $2
              AND status IN ('unpaid', 'partially_paid', 'overdue')
              AND amount_paid = 0
            RETURNING *
            "#,
        )
        .bind(branch_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to cancel invoice: {}", e)))?;

        timer.observe_duration();

        match updated {
            Some(invoice) => {
                info!(invoice_id = %invoice_id, "Invoice cancelled");
                Ok(invoice)
            }
            None => match self.load_invoice(branch_id, invoice_id).await? {
                Some(invoice) => Err(FeeError::InvalidTransition {
                    invoice_id,
                    from: invoice.status,
                    to: "cancelled",
                }),
                None => Err(FeeError::InvoiceNotFound(invoice_id)),
            },
        }
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id))]
    async fn credit_balance(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<Decimal, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["credit_balance"])
            .start_timer();

        let balance: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(remaining_amount), 0)
            FROM credit_entries
            WHERE branch_id = $1 AND student_id = $2
            "#,
        )
        .bind(branch_id)
        .bind(student_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to sum credit balance: {}", e)))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(branch_id = %branch_id, student_id = %student_id))]
    async fn payment_summary(
        &self,
        branch_id: Uuid,
        student_id: Uuid,
    ) -> Result<PaymentSummary, FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["payment_summary"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE branch_id = $1 AND student_id = $2",
        )
        .bind(branch_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to load invoices: {}", e)))?;

        let mut counts = InvoiceStatusCounts::default();
        let mut total_expected = Decimal::ZERO;
        let mut total_paid = Decimal::ZERO;

        for invoice in &invoices {
            let status = invoice.parsed_status();
            match status {
                InvoiceStatus::Unpaid => counts.unpaid += 1,
                InvoiceStatus::PartiallyPaid => counts.partially_paid += 1,
                InvoiceStatus::Paid => counts.paid += 1,
                InvoiceStatus::Overdue => counts.overdue += 1,
                InvoiceStatus::Waived => counts.waived += 1,
                InvoiceStatus::Cancelled => counts.cancelled += 1,
            }
            // Waived and cancelled invoices are counted but carry no
            // outstanding obligation.
            if status.is_open() || status == InvoiceStatus::Paid {
                total_expected += invoice.total_amount_due
                    - invoice.discount_amount
                    - invoice.scholarship_amount;
                total_paid += invoice.amount_paid;
            }
        }

        let credit_balance = self.credit_balance(branch_id, student_id).await?;

        timer.observe_duration();
        Ok(PaymentSummary {
            total_expected,
            total_paid,
            total_balance: total_expected - total_paid,
            credit_balance,
            invoice_counts: counts,
        })
    }
}

/// Unit of work that commits the whole write set inside a single database
/// transaction. Requires the backend to support multi-statement transactions.
#[derive(Clone)]
pub struct PgAtomicUnitOfWork {
    db: Database,
}

impl PgAtomicUnitOfWork {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionalUnitOfWork for PgAtomicUnitOfWork {
    #[instrument(skip(self, set), fields(reference = %set.external_reference))]
    async fn commit_reconciliation(&self, set: &ReconciliationWriteSet) -> Result<(), FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_reconciliation"])
            .start_timer();

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

        if !insert_marker(&mut tx, set).await? {
            return Err(FeeError::DuplicateTransaction {
                reference: set.external_reference.clone(),
                method: set.method.as_str().to_string(),
            });
        }

        // Repairs finish entity writes whose records already exist.
        for repair in &set.repairs {
            apply_invoice_mutation(&mut tx, set.branch_id, repair).await?;
        }

        for mutation in &set.mutations {
            insert_allocation(
                &mut tx,
                set.branch_id,
                set.student_id,
                &set.external_reference,
                set.method.as_str(),
                Some(mutation.invoice_id),
                mutation.amount_applied,
            )
            .await?;
            apply_invoice_mutation(&mut tx, set.branch_id, mutation).await?;
        }

        if let Some(credit) = &set.credit {
            insert_allocation(
                &mut tx,
                set.branch_id,
                set.student_id,
                &set.external_reference,
                set.method.as_str(),
                None,
                credit.amount,
            )
            .await?;
            insert_credit(
                &mut tx,
                set.branch_id,
                set.student_id,
                credit.credit_id,
                credit.amount,
                &set.external_reference,
            )
            .await?;
        }

        if let Some(credit) = &set.credit_repair {
            insert_credit(
                &mut tx,
                set.branch_id,
                set.student_id,
                credit.credit_id,
                credit.amount,
                &set.external_reference,
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to commit: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, set), fields(invoice_id = %set.mutation.invoice_id))]
    async fn commit_credit_application(&self, set: &CreditWriteSet) -> Result<(), FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_credit_application"])
            .start_timer();

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to begin transaction: {}", e)))?;

        for repair in &set.drain_repairs {
            drain_credit(&mut tx, set.branch_id, repair).await?;
        }
        for drain in &set.drains {
            insert_allocation(
                &mut tx,
                set.branch_id,
                set.student_id,
                &drain.credit_id.to_string(),
                PaymentMethod::Credit.as_str(),
                Some(set.mutation.invoice_id),
                drain.amount_applied,
            )
            .await?;
            drain_credit(&mut tx, set.branch_id, drain).await?;
        }
        apply_invoice_mutation(&mut tx, set.branch_id, &set.mutation).await?;

        tx.commit()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to commit: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }
}

/// Decrement one credit entry under its optimistic guard.
async fn drain_credit(
    conn: &mut PgConnection,
    branch_id: Uuid,
    drain: &crate::services::store::CreditDrain,
) -> Result<(), FeeError> {
    let result = sqlx::query(
        r#"
        UPDATE credit_entries
        SET remaining_amount = $1, status = $2
        WHERE branch_id = $3 AND credit_id = $4 AND remaining_amount = $5
        "#,
    )
    .bind(drain.new_remaining)
    .bind(drain.new_status.as_str())
    .bind(branch_id)
    .bind(drain.credit_id)
    .bind(drain.expected_remaining)
    .execute(&mut *conn)
    .await
    .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to drain credit: {}", e)))?;

    if result.rows_affected() != 1 {
        return Err(FeeError::StorageConflict);
    }
    Ok(())
}

/// Unit of work for backends without multi-statement transactions. Writes
/// land one statement at a time in a deterministic order chosen so that a
/// crash leaves a resumable ledger: each allocation record commits before
/// the entity write it describes, and the idempotency marker lands last.
/// The next attempt finishes interrupted entity writes from the records.
#[derive(Clone)]
pub struct PgOrderedUnitOfWork {
    db: Database,
}

impl PgOrderedUnitOfWork {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionalUnitOfWork for PgOrderedUnitOfWork {
    #[instrument(skip(self, set), fields(reference = %set.external_reference))]
    async fn commit_reconciliation(&self, set: &ReconciliationWriteSet) -> Result<(), FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_reconciliation_ordered"])
            .start_timer();

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to acquire connection: {}", e)))?;

        // Record before entity write, always: a crash between the two
        // leaves an allocation record the next attempt repairs from. The
        // reverse order would leave money on an invoice that no record
        // accounts for, and a resume would allocate it again.
        let mut applied = 0usize;
        for repair in &set.repairs {
            apply_invoice_mutation(&mut conn, set.branch_id, repair)
                .await
                .map_err(|e| wrap_partial(applied, &set.external_reference, e))?;
            applied += 1;
        }

        for mutation in &set.mutations {
            insert_allocation(
                &mut conn,
                set.branch_id,
                set.student_id,
                &set.external_reference,
                set.method.as_str(),
                Some(mutation.invoice_id),
                mutation.amount_applied,
            )
            .await
            .map_err(|e| wrap_partial(applied, &set.external_reference, e))?;
            apply_invoice_mutation(&mut conn, set.branch_id, mutation)
                .await
                .map_err(|e| wrap_partial(1, &set.external_reference, e))?;
            applied += 1;
        }

        if let Some(credit) = &set.credit {
            insert_allocation(
                &mut conn,
                set.branch_id,
                set.student_id,
                &set.external_reference,
                set.method.as_str(),
                None,
                credit.amount,
            )
            .await
            .map_err(|e| wrap_partial(applied, &set.external_reference, e))?;
            insert_credit(
                &mut conn,
                set.branch_id,
                set.student_id,
                credit.credit_id,
                credit.amount,
                &set.external_reference,
            )
            .await
            .map_err(|e| wrap_partial(1, &set.external_reference, e))?;
            applied += 1;
        }

        if let Some(credit) = &set.credit_repair {
            insert_credit(
                &mut conn,
                set.branch_id,
                set.student_id,
                credit.credit_id,
                credit.amount,
                &set.external_reference,
            )
            .await
            .map_err(|e| wrap_partial(applied, &set.external_reference, e))?;
            applied += 1;
        }

        // Marker last: a crash before this point leaves the payment
        // unmarked, and the next attempt resumes from the allocation
        // records instead of double-applying.
        if !insert_marker(&mut conn, set).await? {
            return Err(FeeError::DuplicateTransaction {
                reference: set.external_reference.clone(),
                method: set.method.as_str().to_string(),
            });
        }

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, set), fields(invoice_id = %set.mutation.invoice_id))]
    async fn commit_credit_application(&self, set: &CreditWriteSet) -> Result<(), FeeError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["commit_credit_application_ordered"])
            .start_timer();

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| FeeError::Storage(anyhow::anyhow!("Failed to acquire connection: {}", e)))?;

        // Same discipline as reconciliation: each drain's record commits
        // before the decrement it describes, and the invoice lands last.
        let reference = set.mutation.invoice_id.to_string();
        let mut applied = 0usize;
        for repair in &set.drain_repairs {
            drain_credit(&mut conn, set.branch_id, repair)
                .await
                .map_err(|e| wrap_partial(applied, &reference, e))?;
            applied += 1;
        }
        for drain in &set.drains {
            insert_allocation(
                &mut conn,
                set.branch_id,
                set.student_id,
                &drain.credit_id.to_string(),
                PaymentMethod::Credit.as_str(),
                Some(set.mutation.invoice_id),
                drain.amount_applied,
            )
            .await
            .map_err(|e| wrap_partial(applied, &reference, e))?;
            drain_credit(&mut conn, set.branch_id, drain)
                .await
                .map_err(|e| wrap_partial(1, &reference, e))?;
            applied += 1;
        }
        apply_invoice_mutation(&mut conn, set.branch_id, &set.mutation)
            .await
            .map_err(|e| wrap_partial(applied, &reference, e))?;

        timer.observe_duration();
        Ok(())
    }
}

/// A failure after at least one durable write is a partial failure; before
/// any write it surfaces unchanged so the retry loop can treat it normally.
fn wrap_partial(applied: usize, reference: &str, err: FeeError) -> FeeError {
    if applied == 0 {
        return err;
    }
    FeeError::PartialFailure {
        reference: reference.to_string(),
        source: anyhow::anyhow!(err),
    }
}
