// src/error.rs
//
// =============================================================================
// RAGKEEPER: ERROR TAXONOMY
// =============================================================================
//
// One variant per abstract error kind from the design's propagation policy.
// Library code returns `Result<T, IndexError>`; the binary glue in main.rs
// converts to `anyhow::Result` at the CLI boundary.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum IndexError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("load error: {0}")]
    Load(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("health check error: {0}")]
    Health(String),
}

impl IndexError {
    /// The abstract kind name used in the HTTP `{error_kind, message}` shape.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::Config(_) => "ConfigError",
            IndexError::Load(_) => "LoadError",
            IndexError::Ledger(_) => "LedgerError",
            IndexError::Embedding(_) => "EmbeddingError",
            IndexError::Store(_) => "StoreError",
            IndexError::Schedule(_) => "ScheduleError",
            IndexError::Health(_) => "HealthError",
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;
