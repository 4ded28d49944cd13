//! Audit records for balance mutations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Amount;
use crate::error::Error;
use crate::model::account::BalanceChange;

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deposit,
    Withdraw,
}

/// Store that served the mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Relational store, row locking
    Durable,
    /// Key-value cache, watch and retry
    Cache,
}

/// Result of a mutation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// One record per attempted mutation, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub operation: Operation,
    pub store: StoreKind,
    pub account_id: String,
    /// Requested amount
    pub amount: Amount,
    /// Balance before the mutation, when the store got far enough to read it
    pub balance_before: Option<Amount>,
    /// Balance after the mutation; equals `balance_before` on failure
    pub balance_after: Option<Amount>,
    pub outcome: Outcome,
    /// Error message for failed attempts
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Build the audit record for a finished mutation attempt
    pub fn record(
        operation: Operation,
        store: StoreKind,
        account_id: &str,
        amount: Amount,
        result: Result<&BalanceChange, &Error>,
    ) -> Self {
        let (balance_before, balance_after, outcome, error) = match result {
            Ok(change) => (Some(change.before), Some(change.after), Outcome::Success, None),
            Err(err) => {
                let observed = err.observed_balance();
                (observed, observed, Outcome::Failure, Some(err.to_string()))
            }
        };

        Self {
            operation,
            store,
            account_id: account_id.to_string(),
            amount,
            balance_before,
            balance_after,
            outcome,
            error,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
