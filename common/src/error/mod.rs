//! Error types for the balance engine
//!
//! This module provides the error taxonomy shared by both ledger stores and
//! the balance service. Store-level failures are converted into these
//! variants before they cross the service boundary, so callers see the same
//! set of errors regardless of which concurrency strategy served the request.

use std::fmt::Display;
use thiserror::Error;

use crate::decimal::Amount;

/// Balance engine error type
#[derive(Debug, Error)]
pub enum Error {
    /// Target account is missing or could not be read at lock/read time
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Withdraw amount exceeds the current balance
    #[error("Insufficient balance: account {account} holds {balance}, requested {requested}")]
    InsufficientBalance {
        account: String,
        balance: Amount,
        requested: Amount,
    },

    /// Row lock or cache watch could not be established
    #[error("Failed to lock account: {0}")]
    LockAcquisitionFailed(String),

    /// A new balance was computed but the write did not commit
    #[error("Failed to update balance: {account}: {reason}")]
    UpdateFailed {
        account: String,
        /// Balance read before the failed write; the stored value is unchanged
        balance: Option<Amount>,
        reason: String,
    },

    /// Stored value is not a valid decimal amount
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Operation is declared but has no defined semantics
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Decimal conversion error
    #[error("Decimal conversion error: {0}")]
    DecimalError(String),
}

impl Error {
    /// Balance observed by the store when the failure happened, if any
    pub fn observed_balance(&self) -> Option<Amount> {
        match self {
            Error::InsufficientBalance { balance, .. } => Some(*balance),
            Error::UpdateFailed { balance, .. } => *balance,
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait to add context to error results
pub trait ErrorExt<T> {
    /// Add context information to an error
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T> ErrorExt<T> for Result<T> {
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|e| {
            let context = context_fn().to_string();
            match e {
                Error::AccountNotFound(msg) => Error::AccountNotFound(format!("{}: {}", context, msg)),
                Error::LockAcquisitionFailed(msg) => Error::LockAcquisitionFailed(format!("{}: {}", context, msg)),
                Error::UpdateFailed { account, balance, reason } => Error::UpdateFailed {
                    account,
                    balance,
                    reason: format!("{}: {}", context, reason),
                },
                Error::Internal(msg) => Error::Internal(format!("{}: {}", context, msg)),
                Error::ValidationError(msg) => Error::ValidationError(format!("{}: {}", context, msg)),
                Error::ConfigurationError(msg) => Error::ConfigurationError(format!("{}: {}", context, msg)),
                Error::NotImplemented(msg) => Error::NotImplemented(format!("{}: {}", context, msg)),
                Error::DecimalError(msg) => Error::DecimalError(format!("{}: {}", context, msg)),
                e @ Error::InsufficientBalance { .. } => e,
                Error::Database(e) => Error::Database(e),
                Error::Migration(e) => Error::Migration(e),
                Error::Cache(e) => Error::Cache(e),
            }
        })
    }
}

/// From rust_decimal::Error
impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::DecimalError(err.to_string())
    }
}
