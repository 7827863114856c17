//! Collected fees aggregation
//!
//! Keeps a high-water mark (the highest stored fees height). Each run sums,
//! over the indexed transactions in `(mark, latest height]`:
//! - fee amounts paid in the configured denomination
//! - amounts carried by the stable-fee charge event attribute
//!
//! and upserts both totals at the latest height. If the mark already equals
//! the latest height the run is a no-op. A skipped run only widens the next range.
//! A failed run leaves the mark where it was, so its range is scanned again.

use crate::db::{BlockIndex, MetricsStore};
use crate::error::{PipelineError, StoreError};
use crate::source::rest::parse_dec;
use crate::types::{truncate_to_amount, Amount, Height, IndexedTransaction};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Which event carries the stable fee, and under which attribute
#[derive(Debug, Clone)]
pub struct StableFeeEvent {
    pub event_type: String,
    pub attribute_key: String,
}

/// Totals of one aggregation range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeTotals {
    pub fee_value: Amount,
    pub stable_fee_value: Amount,
}

/// Sum fee and stable-fee amounts over `transactions`
///
/// Stable-fee values may be decimal strings (`"1500.000000"`). They are
/// summed exactly and only the total is truncated to whole base units. A value
/// that does not parse fails the whole range so the high-water mark never
/// moves past amounts that were not counted.
pub fn sum_fees(
    transactions: &[IndexedTransaction],
    denom: &str,
    stable_fee: &StableFeeEvent,
) -> Result<FeeTotals, PipelineError> {
    let mut fee_value: Amount = 0;
    let mut stable_fee_value = Decimal::ZERO;

    for tx in transactions {
        for coin in tx.fee.iter().filter(|c| c.denom == denom) {
            fee_value = fee_value
                .checked_add(coin.amount)
                .ok_or(PipelineError::Overflow("collected fees"))?;
        }

        let charged = tx
            .events
            .iter()
            .filter(|e| e.kind == stable_fee.event_type)
            .flat_map(|e| e.attributes.iter())
            .filter(|a| a.key == stable_fee.attribute_key);
        for attribute in charged {
            // Event values are sometimes JSON-quoted strings
            let raw = attribute.value.trim().trim_matches('"');
            let amount = parse_dec("summing stable fee events", raw).map_err(|e| {
                log::error!(
                    "Unparsable {} value in tx {}: {}",
                    stable_fee.attribute_key,
                    tx.hash,
                    e
                );
                e
            })?;
            stable_fee_value = stable_fee_value
                .checked_add(amount)
                .ok_or(PipelineError::Overflow("collected stable fees"))?;
        }
    }

    Ok(FeeTotals {
        fee_value,
        stable_fee_value: truncate_to_amount(stable_fee_value),
    })
}

pub struct FeeAggregator {
    blocks: Arc<dyn BlockIndex>,
    metrics: Arc<dyn MetricsStore>,
    denom: String,
    stable_fee: StableFeeEvent,
}

impl FeeAggregator {
    pub fn new(
        blocks: Arc<dyn BlockIndex>,
        metrics: Arc<dyn MetricsStore>,
        denom: impl Into<String>,
        stable_fee: StableFeeEvent,
    ) -> Self {
        Self {
            blocks,
            metrics,
            denom: denom.into(),
            stable_fee,
        }
    }

    /// Scheduler entry point
    pub async fn update_collected_fees(&self) -> Result<(), PipelineError> {
        self.run().await.map(|_| ())
    }

    /// Aggregate the not yet covered range; `None` when already up to date
    pub async fn run(&self) -> Result<Option<FeeTotals>, PipelineError> {
        log::debug!("Updating collected fees");

        let block = self.blocks.latest_block().await?;
        let latest_saved_fees_height = self.metrics.latest_fees_height().await?;

        if latest_saved_fees_height == block.height {
            log::debug!("Fees already updated at height {}", latest_saved_fees_height);
            return Ok(None);
        }

        log::debug!(
            "Updating fees for heights {}..={}",
            latest_saved_fees_height + 1,
            block.height
        );
        let transactions = self
            .blocks
            .transactions_in_range(latest_saved_fees_height + 1, block.height)
            .await?;
        let totals = sum_fees(&transactions, &self.denom, &self.stable_fee)?;
        log::debug!(
            "Total fees: {}, total stable fees: {} over {} transactions",
            totals.fee_value,
            totals.stable_fee_value,
            transactions.len()
        );

        self.metrics
            .upsert_fees(block.height, totals.fee_value, totals.stable_fee_value)
            .await?;
        log::info!("Collected fees stored at height {}", block.height);

        Ok(Some(totals))
    }

    /// Read surface: highest stored fees height, 0 if none
    pub async fn latest_fees_height(&self) -> Result<Height, StoreError> {
        self.metrics.latest_fees_height().await
    }
}
