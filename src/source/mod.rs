//! Chain state source
//!
//! Every query is pinned to an explicit height so that one aggregation run
//! never mixes state from different blocks.

pub mod rest;

use crate::error::SourceError;
use crate::types::{AccountBalance, ChainAccount, Coin, DecCoin, Height};
use async_trait::async_trait;

pub use rest::RestChainSource;

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Total supply of every denomination at `height`
    async fn total_supply_at(&self, height: Height) -> Result<Vec<Coin>, SourceError>;

    /// Community pool balance at `height`
    async fn community_pool_at(&self, height: Height) -> Result<Vec<DecCoin>, SourceError>;

    /// The complete account set at `height`
    async fn enumerate_accounts(&self, height: Height) -> Result<Vec<ChainAccount>, SourceError>;

    /// One account at `height`, `None` if it does not exist
    async fn account_at(
        &self,
        address: &str,
        height: Height,
    ) -> Result<Option<ChainAccount>, SourceError>;

    /// Spendable, delegated, unbonding and reward balances of one account
    async fn balance_at(&self, address: &str, height: Height)
        -> Result<AccountBalance, SourceError>;
}
