//! Application startup and lifecycle management.

use crate::config::{CommitMode, FeesConfig, StorageBackend};
use crate::handlers::{invoices, payments, students};
use crate::services::{
    get_metrics, init_metrics, CreditApplicationService, Database, FeeStore, MemoryStore,
    PgAtomicUnitOfWork, PgOrderedUnitOfWork, ReconciliationEngine, StudentLocks,
    TransactionalUnitOfWork,
};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: FeesConfig,
    pub store: Arc<dyn FeeStore>,
    pub engine: Arc<ReconciliationEngine>,
    pub credit: Arc<CreditApplicationService>,
}

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn FeeStore>,
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "fees-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - storage unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "fees-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.store.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: FeesConfig) -> Result<Self, AppError> {
        init_metrics();

        let (store, uow): (Arc<dyn FeeStore>, Arc<dyn TransactionalUnitOfWork>) =
            match config.storage.backend {
                StorageBackend::Postgres => {
                    let db_config = config.storage.database.as_ref().ok_or_else(|| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "Postgres backend selected but no database configuration present"
                        ))
                    })?;

                    let db = Database::new(
                        &db_config.url,
                        db_config.max_connections,
                        db_config.min_connections,
                    )
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                        AppError::from(e)
                    })?;

                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        AppError::from(e)
                    })?;

                    let uow: Arc<dyn TransactionalUnitOfWork> = match config.storage.commit_mode {
                        CommitMode::Atomic => Arc::new(PgAtomicUnitOfWork::new(db.clone())),
                        CommitMode::Ordered => {
                            tracing::info!(
                                "Ordered commit mode: writes land one statement at a time"
                            );
                            Arc::new(PgOrderedUnitOfWork::new(db.clone()))
                        }
                    };
                    (Arc::new(db), uow)
                }
                StorageBackend::Memory => {
                    if config.storage.commit_mode == CommitMode::Ordered {
                        tracing::info!(
                            "Memory backend commits atomically; ordered mode has no effect"
                        );
                    }
                    let mem = Arc::new(MemoryStore::new());
                    (mem.clone(), mem)
                }
            };

        let locks = Arc::new(StudentLocks::new());
        let max_retries = config.reconciliation.max_retries;

        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            uow.clone(),
            locks.clone(),
            max_retries,
        ));
        let credit = Arc::new(CreditApplicationService::new(
            store.clone(),
            uow,
            locks,
            max_retries,
        ));

        let state = AppState {
            config: config.clone(),
            store,
            engine,
            credit,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Fees service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let health_state = HealthState {
            store: self.state.store.clone(),
        };

        let health_router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .with_state(health_state);

        let api_router = Router::new()
            .route("/invoices", post(invoices::create_invoice))
            .route("/invoices/:invoice_id", get(invoices::get_invoice))
            .route("/invoices/:invoice_id/waive", post(invoices::waive_invoice))
            .route(
                "/invoices/:invoice_id/cancel",
                post(invoices::cancel_invoice),
            )
            .route(
                "/invoices/:invoice_id/allocations",
                get(invoices::invoice_allocations),
            )
            .route("/payments/reconcile", post(payments::reconcile_payment))
            .route(
                "/students/:student_id/credit-balance",
                get(students::credit_balance),
            )
            .route(
                "/students/:student_id/payment-summary",
                get(students::payment_summary),
            )
            .with_state(self.state);

        let router = health_router
            .merge(api_router)
            .layer(TraceLayer::new_for_http())
            .layer(middleware::from_fn(metrics_middleware))
            .layer(middleware::from_fn(request_id_middleware));

        tracing::info!(
            service = "fees-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await
    }
}
