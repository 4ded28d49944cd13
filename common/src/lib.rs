//! Common types and utilities for the balance engine
//!
//! This library contains the types shared by the ledger stores and the
//! balance service: the error taxonomy, decimal amounts, account and audit
//! models, and the scoped database transaction layer.

pub mod error;
pub mod model;
pub mod decimal;
pub mod db;

/// Re-export important types
pub use error::{Error, Result, ErrorExt};
pub use decimal::*;

// Re-export database types
pub use db::transaction::{DBTransaction, TransactionManager};
