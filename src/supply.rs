//! Circulating supply aggregation
//!
//! ```text
//! circulating = total supply - locked vesting - module accounts - community pool
//! ```
//!
//! Every input is read as of the latest indexed block (height for chain
//! queries, block time for the vesting formula). The result is upserted at
//! that height; re-running at the same height overwrites it. A negative
//! result is stored as is: it means the top-accounts snapshot or the vesting
//! data is stale until the next refresh.

use crate::db::{AccountDirectory, BlockIndex, MetricsStore};
use crate::error::{PipelineError, StoreError};
use crate::source::ChainSource;
use crate::types::{amount_of, dec_amount_of, truncate_to_amount, Amount, Height};
use crate::vesting::VestingLedger;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Every term of one circulating supply computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupplyBreakdown {
    pub height: Height,
    pub total_supply: Amount,
    pub locked_vesting: Amount,
    pub module_accounts: Amount,
    pub community_pool: Amount,
    pub circulating_supply: Amount,
}

/// `total - locked - module - pool`, with overflow reported instead of wrapped
pub fn circulating_supply(
    total_supply: Amount,
    locked_vesting: Amount,
    module_accounts: Amount,
    community_pool: Amount,
) -> Result<Amount, PipelineError> {
    total_supply
        .checked_sub(locked_vesting)
        .and_then(|v| v.checked_sub(module_accounts))
        .and_then(|v| v.checked_sub(community_pool))
        .ok_or(PipelineError::Overflow("circulating supply"))
}

/// Convert base units to display units (`amount / 10^exponent`)
pub fn to_display_units(amount: Amount, exponent: u32) -> Result<Decimal, PipelineError> {
    Decimal::try_from_i128_with_scale(amount, exponent)
        .map(|d| d.normalize())
        .map_err(|_| PipelineError::Overflow("display amount"))
}

pub struct SupplyAggregator {
    blocks: Arc<dyn BlockIndex>,
    ledger: VestingLedger,
    directory: Arc<dyn AccountDirectory>,
    metrics: Arc<dyn MetricsStore>,
    source: Arc<dyn ChainSource>,
    denom: String,
    module_account_type: String,
}

impl SupplyAggregator {
    pub fn new(
        blocks: Arc<dyn BlockIndex>,
        ledger: VestingLedger,
        directory: Arc<dyn AccountDirectory>,
        metrics: Arc<dyn MetricsStore>,
        source: Arc<dyn ChainSource>,
        module_account_type: impl Into<String>,
    ) -> Self {
        let denom = ledger.denom().to_string();
        Self {
            blocks,
            ledger,
            directory,
            metrics,
            source,
            denom,
            module_account_type: module_account_type.into(),
        }
    }

    /// Scheduler entry point
    pub async fn update_circulating_supply(&self) -> Result<(), PipelineError> {
        self.compute_and_store().await.map(|_| ())
    }

    /// Compute the circulating supply at the latest indexed block and persist it
    pub async fn compute_and_store(&self) -> Result<SupplyBreakdown, PipelineError> {
        log::debug!("Updating circulating supply");

        let block = self.blocks.latest_block().await?;

        let locked_vesting = self.ledger.sum_locked_at(block.timestamp).await?;
        let module_accounts = self.directory.sum_by_type(&self.module_account_type).await?;
        log::debug!(
            "Locked tokens sum: {}, module accounts sum: {}",
            locked_vesting,
            module_accounts
        );

        let total_supply = amount_of(&self.source.total_supply_at(block.height).await?, &self.denom)?;
        log::debug!("Total supply amount: {}", total_supply);

        let pool = self.source.community_pool_at(block.height).await?;
        let community_pool = truncate_to_amount(dec_amount_of(&pool, &self.denom)?);
        log::debug!("Community pool amount: {}", community_pool);

        let circulating =
            circulating_supply(total_supply, locked_vesting, module_accounts, community_pool)?;
        if circulating < 0 {
            log::warn!(
                "Circulating supply at height {} is negative ({}); account data may be stale",
                block.height,
                circulating
            );
        }

        self.metrics
            .upsert_circulating_supply(block.height, circulating)
            .await?;
        log::info!(
            "Circulating supply at height {}: {} {}",
            block.height,
            circulating,
            self.denom
        );

        Ok(SupplyBreakdown {
            height: block.height,
            total_supply,
            locked_vesting,
            module_accounts,
            community_pool,
            circulating_supply: circulating,
        })
    }

    /// Read surface: latest stored value (`StoreError::NotFound` if none)
    pub async fn latest_circulating_supply(&self) -> Result<Amount, StoreError> {
        self.metrics.latest_circulating_supply().await
    }

    /// Read surface: latest stored value in display units
    pub async fn latest_circulating_supply_display(
        &self,
        exponent: u32,
    ) -> Result<Decimal, PipelineError> {
        let value = self.latest_circulating_supply().await?;
        to_display_units(value, exponent)
    }

    /// Sum of the available balances of the given addresses
    pub async fn available_tokens_sum(&self, addresses: &[String]) -> Result<Amount, StoreError> {
        self.directory.sum_available_for(addresses).await
    }
}
