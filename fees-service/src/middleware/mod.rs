//! Request-scoped context extraction for fees-service.
//!
//! Every billing operation is scoped to a school branch. The branch is
//! carried in the `X-Branch-ID` header, set by the gateway after it has
//! authenticated the caller and checked branch membership.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// Branch scope extracted from request headers.
#[derive(Debug, Clone, Copy)]
pub struct BranchContext {
    pub branch_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for BranchContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Branch-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing X-Branch-ID header (required from gateway)"
                ))
            })?;

        let branch_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("X-Branch-ID is not a valid UUID"))
        })?;

        let span = tracing::Span::current();
        span.record("branch_id", raw);

        Ok(BranchContext { branch_id })
    }
}
