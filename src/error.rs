//! Error types for the Ingestion Service

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Transient network error from {source_id}: {message}")]
    TransientNetwork {
        source_id: String,
        message: String,
    },

    #[error("Authentication rejected by source: {0}")]
    Authentication(String),

    #[error("API error: {code} - {message}")]
    ApiError {
        code: String,
        message: String,
    },

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Adapter timed out after {0:?}")]
    Timeout(Duration),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

impl IngestionError {
    /// Errors worth another attempt within the same tick
    pub fn is_transient(&self) -> bool {
        match self {
            IngestionError::TransientNetwork { .. } => true,
            IngestionError::HttpError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, IngestionError::Authentication(_))
    }

    /// Short label used in job summaries and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::HttpError(_) if self.is_transient() => "transient_network",
            IngestionError::HttpError(_) => "http",
            IngestionError::JsonError(_) | IngestionError::ParseError(_) => "parse",
            IngestionError::DatabaseError(_) | IngestionError::PersistenceError(_) => "persistence",
            IngestionError::ConfigError(_) => "config",
            IngestionError::TransientNetwork { .. } => "transient_network",
            IngestionError::Authentication(_) => "authentication",
            IngestionError::ApiError { .. } => "api",
            IngestionError::Timeout(_) => "timeout",
            IngestionError::ShutdownRequested => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
