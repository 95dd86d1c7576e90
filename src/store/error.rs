//! Store error types.

use thiserror::Error;

use crate::claim_lock::LockError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Lock service error: {0}")]
    Lock(#[from] LockError),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Context not found: {0}")]
    NotFound(String),
    #[error("Rejected by task service: {0}")]
    Rejected(String),
    #[error("Configuration error: {0}")]
    Config(String),
}
