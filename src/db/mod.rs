//! Storage traits for the ledger, the account directory and the derived metrics
//!
//! Tables (see `/sql/`):
//! - `block`, `transaction` - locally indexed chain data (read-only here except in tests/indexer)
//! - `account` - INSERT, conflicts ignored
//! - `vesting_account` - UPSERT on address, last write wins
//! - `vesting_period` - full replace per vesting account
//! - `top_accounts` - UPSERT on address, balance columns written by the refreshers
//! - `circulating_supply`, `fees` - UPSERT on height
//!
//! Every write operation is its own atomic unit. Nothing spans two of them.

pub mod sqlite;

use crate::error::StoreError;
use crate::types::{
    Account, Amount, Height, IndexedTransaction, LatestBlock, TopAccount, TopAccountBalance,
    VestingAccount, VestingPeriod,
};
use async_trait::async_trait;

pub use sqlite::SqliteStore;

/// Maximum number of bound parameters per SQL statement
///
/// SQLite's historical `SQLITE_MAX_VARIABLE_NUMBER`.
pub const MAX_SQL_PARAMS: usize = 999;

/// Split `items` into consecutive chunks of at most `max_params / params_per_row` rows
///
/// Order is preserved and empty chunks are never produced.
pub fn split_in_chunks<T>(items: &[T], params_per_row: usize, max_params: usize) -> Vec<&[T]> {
    let rows_per_chunk = (max_params / params_per_row.max(1)).max(1);
    items
        .chunks(rows_per_chunk)
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// Vesting account records and their unlock schedules
#[async_trait]
pub trait VestingStore: Send + Sync {
    /// Store or replace a vesting account
    ///
    /// For periodic accounts the full period list is replaced in the same
    /// transaction: no period of an older, longer schedule survives.
    async fn upsert_vesting_account(&self, account: &VestingAccount) -> Result<(), StoreError>;

    /// Every stored vesting account, periods included
    async fn vesting_accounts(&self) -> Result<Vec<VestingAccount>, StoreError>;

    /// Stored periods of one account, in order (empty if none)
    async fn vesting_periods(&self, address: &str) -> Result<Vec<VestingPeriod>, StoreError>;
}

/// Known account addresses plus the typed top-accounts snapshot
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Batch insert; existing rows are left untouched
    async fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StoreError>;

    /// Batch upsert of typed snapshot rows for `height`
    async fn upsert_top_accounts(
        &self,
        entries: &[TopAccount],
        height: Height,
    ) -> Result<(), StoreError>;

    /// Write the balance columns of one top-accounts row
    async fn save_top_account_balance(
        &self,
        address: &str,
        balance: &TopAccountBalance,
    ) -> Result<(), StoreError>;

    /// Sum of the `sum` column over every row of the given type
    async fn sum_by_type(&self, type_url: &str) -> Result<Amount, StoreError>;

    /// Sum of the `available` column over the given addresses
    async fn sum_available_for(&self, addresses: &[String]) -> Result<Amount, StoreError>;

    async fn accounts(&self) -> Result<Vec<String>, StoreError>;
}

/// Derived time series keyed by height
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Insert, or overwrite the value already stored for `height`
    async fn upsert_circulating_supply(&self, height: Height, value: Amount)
        -> Result<(), StoreError>;

    /// Value at the highest stored height; `StoreError::NotFound` if none
    async fn latest_circulating_supply(&self) -> Result<Amount, StoreError>;

    async fn upsert_fees(
        &self,
        height: Height,
        fee_value: Amount,
        stable_fee_value: Amount,
    ) -> Result<(), StoreError>;

    /// Highest stored fees height; 0 when nothing was recorded yet
    async fn latest_fees_height(&self) -> Result<Height, StoreError>;

    /// `(fee_value, stable_fee_value)` stored at `height`, if any
    async fn fees_at(&self, height: Height) -> Result<Option<(Amount, Amount)>, StoreError>;
}

/// Locally indexed blocks and transactions
#[async_trait]
pub trait BlockIndex: Send + Sync {
    async fn save_block(&self, block: &LatestBlock) -> Result<(), StoreError>;

    async fn save_transaction(&self, tx: &IndexedTransaction) -> Result<(), StoreError>;

    /// Highest indexed block; `StoreError::NotFound` if the index is empty
    async fn latest_block(&self) -> Result<LatestBlock, StoreError>;

    /// Transactions with `from <= height <= to`
    async fn transactions_in_range(
        &self,
        from: Height,
        to: Height,
    ) -> Result<Vec<IndexedTransaction>, StoreError>;
}
