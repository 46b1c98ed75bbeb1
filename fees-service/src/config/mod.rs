//! Configuration module for fees-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct FeesConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub storage: StorageConfig,
    pub reconciliation: ReconciliationConfig,
}

/// Which backend holds the ledger, and whether its unit of work commits
/// atomically or as an ordered sequence of single-row writes. Deployment
/// chooses; the engine never sniffs backend capabilities at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Atomic,
    Ordered,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub commit_mode: CommitMode,
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub max_retries: u32,
}

impl FeesConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let backend = match env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            Ok("postgres") | Err(_) => StorageBackend::Postgres,
            Ok(other) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown STORAGE_BACKEND '{}', expected 'postgres' or 'memory'",
                    other
                )))
            }
        };

        let commit_mode = match env::var("COMMIT_MODE").as_deref() {
            Ok("ordered") => CommitMode::Ordered,
            Ok("atomic") | Err(_) => CommitMode::Atomic,
            Ok(other) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown COMMIT_MODE '{}', expected 'atomic' or 'ordered'",
                    other
                )))
            }
        };

        let database = match backend {
            StorageBackend::Memory => None,
            StorageBackend::Postgres => Some(DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            }),
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "fees-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            storage: StorageConfig {
                backend,
                commit_mode,
                database,
            },
            reconciliation: ReconciliationConfig {
                max_retries: env::var("RECONCILIATION_MAX_RETRIES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
            },
        })
    }
}
