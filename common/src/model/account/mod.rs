//! Account models and related types

use serde::{Deserialize, Serialize};

use crate::decimal::Amount;

/// Account model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Opaque account identifier, assigned at seeding
    pub id: String,
    /// Current balance
    pub balance: Amount,
}

impl Account {
    /// Create a new account with an opening balance
    pub fn new(id: impl Into<String>, balance: Amount) -> Self {
        Self {
            id: id.into(),
            balance,
        }
    }
}

/// Balance before and after a committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub before: Amount,
    pub after: Amount,
}

impl BalanceChange {
    /// Change produced by crediting `amount`
    pub fn credit(before: Amount, amount: Amount) -> Self {
        Self { before, after: before + amount }
    }

    /// Change produced by debiting `amount`
    pub fn debit(before: Amount, amount: Amount) -> Self {
        Self { before, after: before - amount }
    }
}
