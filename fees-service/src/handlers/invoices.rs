//! Invoice lifecycle handlers: creation, waive, cancel, and the per-invoice
//! allocation trail.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::{CreateInvoiceRequest, CreateInvoiceResponse},
    error::FeeError,
    middleware::BranchContext,
    models::{AllocationRecord, CreateInvoice, Invoice},
    startup::AppState,
};

/// Create an invoice. If the student holds stored credit it is drained into
/// the new invoice before the response is written, so callers never see an
/// unpaid invoice alongside available credit.
pub async fn create_invoice(
    State(state): State<AppState>,
    branch: BranchContext,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<CreateInvoiceResponse>), AppError> {
    if payload.total_amount_due <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "total_amount_due must be positive"
        )));
    }
    if payload.discount_amount < Decimal::ZERO || payload.scholarship_amount < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "discount_amount and scholarship_amount cannot be negative"
        )));
    }
    if payload.discount_amount + payload.scholarship_amount > payload.total_amount_due {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "discount and scholarship together exceed the invoice total"
        )));
    }

    if !state
        .store
        .student_exists(branch.branch_id, payload.student_id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::from(FeeError::StudentNotFound(payload.student_id)));
    }

    let invoice = Invoice::new(
        CreateInvoice {
            branch_id: branch.branch_id,
            student_id: payload.student_id,
            period_start: payload.period_start,
            due_date: payload.due_date,
            total_amount_due: payload.total_amount_due,
            discount_amount: payload.discount_amount,
            scholarship_amount: payload.scholarship_amount,
        },
        Utc::now().date_naive(),
    );

    tracing::info!(
        invoice_id = %invoice.invoice_id,
        student_id = %invoice.student_id,
        total_amount_due = %invoice.total_amount_due,
        "Creating invoice"
    );

    state
        .store
        .insert_invoice(&invoice)
        .await
        .map_err(AppError::from)?;

    let outcome = state
        .credit
        .apply_credit_to_invoice(branch.branch_id, payload.student_id, invoice.invoice_id)
        .await
        .map_err(AppError::from)?;

    let invoice = state
        .store
        .load_invoice(branch.branch_id, invoice.invoice_id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::from(FeeError::InvoiceNotFound(invoice.invoice_id)))?;

    let credit_applied = (outcome.amount_applied > Decimal::ZERO).then_some(outcome);

    Ok((
        StatusCode::CREATED,
        Json(CreateInvoiceResponse {
            invoice,
            credit_applied,
        }),
    ))
}

/// Get one invoice.
pub async fn get_invoice(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .store
        .load_invoice(branch.branch_id, invoice_id)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::from(FeeError::InvoiceNotFound(invoice_id)))?;
    Ok(Json(invoice))
}

/// Waive an open invoice, forgiving its remaining balance.
pub async fn waive_invoice(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .store
        .mark_invoice_waived(branch.branch_id, invoice_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(invoice))
}

/// Cancel an open invoice that has received no money.
pub async fn cancel_invoice(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    let invoice = state
        .store
        .mark_invoice_cancelled(branch.branch_id, invoice_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(invoice))
}

/// List every allocation record written against an invoice, oldest first.
pub async fn invoice_allocations(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<Vec<AllocationRecord>>, AppError> {
    let records = state
        .store
        .allocations_for_invoice(branch.branch_id, invoice_id)
        .await
        .map_err(AppError::from)?;
    Ok(Json(records))
}
