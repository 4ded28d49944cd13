//! Bulk account seeding for both stores

use common::decimal::{dec, encode_amount, Amount};
use common::error::{ErrorExt, Result};
use common::model::account::Account;
use tracing::info;

use crate::cache::account_key;
use crate::service::BalanceService;

/// Default number of seeded accounts
pub const DEFAULT_ACCOUNT_COUNT: usize = 100;

/// Default opening balance of a seeded account
pub const DEFAULT_INITIAL_BALANCE: Amount = dec!(1000000);

/// Identifier of the `index`-th seeded account
pub fn account_id(index: usize) -> String {
    format!("ACCOUNT-{}", index)
}

/// Replace the contents of both stores with `count` accounts holding `balance`.
///
/// The durable store is reset inside a single transaction; the cache entries
/// are written in one batch with full decimal precision.
pub async fn seed_accounts(service: &BalanceService, count: usize, balance: Amount) -> Result<Vec<Account>> {
    info!(count, balance = %balance, "generate account seeds");
    let accounts: Vec<Account> = (0..count)
        .map(|i| Account::new(account_id(i), balance))
        .collect();

    let context = service.context();
    let inserted = context
        .ledger
        .repository()
        .reset_accounts(&accounts)
        .await
        .with_context(|| "Failed to seed ledger store")?;
    info!(count = inserted, "insert accounts");

    let entries: Vec<(String, String)> = accounts
        .iter()
        .map(|account| (account_key(&account.id), encode_amount(account.balance)))
        .collect();
    context
        .cache
        .backend()
        .set_many(&entries)
        .await
        .with_context(|| "Failed to seed cache store")?;
    info!(count = entries.len(), "cache accounts");

    info!(count = accounts.len(), "seeding success");
    Ok(accounts)
}
