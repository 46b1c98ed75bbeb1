//! Per-student read handlers: credit balance and payment summary.

use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    dtos::CreditBalanceResponse,
    error::FeeError,
    middleware::BranchContext,
    models::PaymentSummary,
    startup::AppState,
};

/// Remaining credit across all of the student's credit entries.
pub async fn credit_balance(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(student_id): Path<Uuid>,
) -> Result<Json<CreditBalanceResponse>, AppError> {
    ensure_student(&state, branch, student_id).await?;

    let credit_balance = state
        .store
        .credit_balance(branch.branch_id, student_id)
        .await
        .map_err(AppError::from)?;

    Ok(Json(CreditBalanceResponse {
        student_id,
        credit_balance,
    }))
}

/// Aggregate position: expected vs paid vs outstanding, plus credit and
/// invoice status counts.
pub async fn payment_summary(
    State(state): State<AppState>,
    branch: BranchContext,
    Path(student_id): Path<Uuid>,
) -> Result<Json<PaymentSummary>, AppError> {
    ensure_student(&state, branch, student_id).await?;

    let summary = state
        .store
        .payment_summary(branch.branch_id, student_id)
        .await
        .map_err(AppError::from)?;

    Ok(Json(summary))
}

async fn ensure_student(
    state: &AppState,
    branch: BranchContext,
    student_id: Uuid,
) -> Result<(), AppError> {
    if !state
        .store
        .student_exists(branch.branch_id, student_id)
        .await
        .map_err(AppError::from)?
    {
        return Err(AppError::from(FeeError::StudentNotFound(student_id)));
    }
    Ok(())
}
