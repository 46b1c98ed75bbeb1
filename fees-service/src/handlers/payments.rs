//! Payment reconciliation handler.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;

use crate::{
    dtos::ReconcileRequest,
    error::FeeError,
    middleware::BranchContext,
    models::ReconciliationSummary,
    startup::AppState,
};

/// Reconcile one validated payment event. Replays of an already-processed
/// reference answer 200 with `already_processed: true` so provider webhook
/// retries stop cleanly instead of alerting.
pub async fn reconcile_payment(
    State(state): State<AppState>,
    branch: BranchContext,
    Json(payload): Json<ReconcileRequest>,
) -> Result<(StatusCode, Json<ReconciliationSummary>), AppError> {
    let occurred_at = payload.occurred_at.unwrap_or_else(Utc::now);

    let result = state
        .engine
        .reconcile(
            branch.branch_id,
            payload.student_id,
            payload.amount,
            &payload.external_reference,
            payload.method,
            occurred_at,
        )
        .await;

    match result {
        Ok(summary) => Ok((StatusCode::OK, Json(summary))),
        Err(FeeError::DuplicateTransaction { .. }) => {
            let prior = state
                .store
                .allocations_for_payment(
                    branch.branch_id,
                    payload.student_id,
                    &payload.external_reference,
                    payload.method,
                )
                .await
                .map_err(AppError::from)?;

            let amount_applied: Decimal = prior
                .iter()
                .filter(|r| r.invoice_id.is_some())
                .map(|r| r.amount_applied)
                .sum();
            let invoices_touched = prior.iter().filter_map(|r| r.invoice_id).collect();

            Ok((
                StatusCode::OK,
                Json(ReconciliationSummary {
                    external_reference: payload.external_reference,
                    amount_applied,
                    invoices_touched,
                    credit_created: None,
                    already_processed: true,
                }),
            ))
        }
        Err(e) => Err(AppError::from(e)),
    }
}
