//! Account refresh pipeline
//!
//! One run:
//! 1. enumerate every account from the chain source at the latest indexed height
//! 2. persist the address list and the typed top-accounts snapshot
//! 3. split the addresses into `batch_count` contiguous batches
//! 4. refresh each batch in its own task, addresses in order within a batch
//!
//! The first failure inside a batch stops that batch only. Other batches run
//! to completion. Work already done is never rolled back. The run fails with
//! the error of the lowest-indexed failing batch.

use crate::db::{AccountDirectory, BlockIndex};
use crate::error::{PipelineError, SourceError};
use crate::source::ChainSource;
use crate::types::{Account, ChainAccount, Height, TopAccount};
use crate::vesting::VestingLedger;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Refreshes the state derived from one account (vesting, balances, ...)
#[async_trait]
pub trait AccountRefresher: Send + Sync {
    async fn refresh_account(&self, address: &str, height: Height) -> Result<(), PipelineError>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Re-reads an account and stores its vesting schedule if it has one
pub struct VestingRefresher {
    source: Arc<dyn ChainSource>,
    ledger: VestingLedger,
}

impl VestingRefresher {
    pub fn new(source: Arc<dyn ChainSource>, ledger: VestingLedger) -> Self {
        Self { source, ledger }
    }
}

#[async_trait]
impl AccountRefresher for VestingRefresher {
    async fn refresh_account(&self, address: &str, height: Height) -> Result<(), PipelineError> {
        // Enumerated at this same height, so absence means the source is inconsistent
        let account = self
            .source
            .account_at(address, height)
            .await?
            .ok_or_else(|| SourceError::AccountNotFound {
                address: address.to_string(),
                height,
            })?;
        if let Some(vesting) = account.vesting {
            self.ledger.upsert_vesting_account(&vesting).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "vesting"
    }
}

/// Re-reads balances and writes the top-accounts balance columns
pub struct BalanceRefresher {
    source: Arc<dyn ChainSource>,
    directory: Arc<dyn AccountDirectory>,
    denom: String,
}

impl BalanceRefresher {
    pub fn new(
        source: Arc<dyn ChainSource>,
        directory: Arc<dyn AccountDirectory>,
        denom: impl Into<String>,
    ) -> Self {
        Self {
            source,
            directory,
            denom: denom.into(),
        }
    }
}

#[async_trait]
impl AccountRefresher for BalanceRefresher {
    async fn refresh_account(&self, address: &str, height: Height) -> Result<(), PipelineError> {
        let balance = self.source.balance_at(address, height).await?.project(&self.denom)?;
        self.directory.save_top_account_balance(address, &balance).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "balances"
    }
}

/// Runs several refreshers in order for one address, stopping at the first error
pub struct RefresherChain {
    refreshers: Vec<Arc<dyn AccountRefresher>>,
}

impl RefresherChain {
    pub fn new(refreshers: Vec<Arc<dyn AccountRefresher>>) -> Self {
        Self { refreshers }
    }
}

#[async_trait]
impl AccountRefresher for RefresherChain {
    async fn refresh_account(&self, address: &str, height: Height) -> Result<(), PipelineError> {
        for refresher in &self.refreshers {
            if let Err(e) = refresher.refresh_account(address, height).await {
                log::debug!("{} refresh failed for {}: {}", refresher.name(), address, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "all"
    }
}

/// Split `items` into at most `batch_count` contiguous batches of near-equal size
///
/// The first `len % batch_count` batches get one extra item. Empty batches are
/// not produced, so fewer items than batches yields one batch per item.
pub fn partition_batches<T>(items: &[T], batch_count: usize) -> Vec<&[T]> {
    let batch_count = batch_count.max(1);
    let base = items.len() / batch_count;
    let remainder = items.len() % batch_count;

    let mut batches = Vec::with_capacity(batch_count);
    let mut start = 0;
    for i in 0..batch_count {
        let size = base + usize::from(i < remainder);
        if size == 0 {
            break;
        }
        batches.push(&items[start..start + size]);
        start += size;
    }
    batches
}

/// Outcome of one batch
#[derive(Debug)]
pub struct BatchOutcome {
    pub index: usize,
    pub refreshed: usize,
    pub error: Option<PipelineError>,
}

/// Result of a refresh run that did not fail before the fan-out
#[derive(Debug)]
pub struct RefreshReport {
    pub height: Height,
    pub total_accounts: usize,
    pub refreshed: usize,
    pub batches: Vec<BatchOutcome>,
}

impl RefreshReport {
    /// Error of the lowest-indexed failing batch
    pub fn into_result(self) -> Result<(), PipelineError> {
        match self.batches.into_iter().find_map(|b| b.error) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct AccountRefreshPipeline {
    blocks: Arc<dyn BlockIndex>,
    source: Arc<dyn ChainSource>,
    directory: Arc<dyn AccountDirectory>,
    refresher: Arc<dyn AccountRefresher>,
    batch_count: usize,
}

impl AccountRefreshPipeline {
    pub fn new(
        blocks: Arc<dyn BlockIndex>,
        source: Arc<dyn ChainSource>,
        directory: Arc<dyn AccountDirectory>,
        refresher: Arc<dyn AccountRefresher>,
        batch_count: usize,
    ) -> Self {
        Self {
            blocks,
            source,
            directory,
            refresher,
            batch_count: batch_count.max(1),
        }
    }

    /// Scheduler entry point
    pub async fn refresh_all_accounts(&self) -> Result<(), PipelineError> {
        self.run().await?.into_result()
    }

    /// Full run, returning the per-batch outcomes
    pub async fn run(&self) -> Result<RefreshReport, PipelineError> {
        log::debug!("Refreshing all top accounts");

        let block = self.blocks.latest_block().await?;
        let accounts = self.refresh_top_accounts_list(block.height).await?;

        if accounts.is_empty() {
            log::info!("No accounts to refresh");
            return Ok(RefreshReport {
                height: block.height,
                total_accounts: 0,
                refreshed: 0,
                batches: Vec::new(),
            });
        }

        let addresses: Vec<String> = accounts.into_iter().map(|a| a.address).collect();
        let batches = self.process_batches(&addresses, block.height).await;
        let refreshed = batches.iter().map(|b| b.refreshed).sum();

        let failed = batches.iter().filter(|b| b.error.is_some()).count();
        if failed == 0 {
            log::info!("All accounts refreshed: {} at height {}", refreshed, block.height);
        } else {
            log::warn!(
                "{} of {} refresh batches failed; {} of {} accounts refreshed",
                failed,
                batches.len(),
                refreshed,
                addresses.len()
            );
        }

        Ok(RefreshReport {
            height: block.height,
            total_accounts: addresses.len(),
            refreshed,
            batches,
        })
    }

    /// Enumerate accounts and persist the directory and the typed snapshot
    pub async fn refresh_top_accounts_list(
        &self,
        height: Height,
    ) -> Result<Vec<Account>, PipelineError> {
        let chain_accounts: Vec<ChainAccount> = self.source.enumerate_accounts(height).await?;

        let accounts: Vec<Account> = chain_accounts
            .iter()
            .map(|a| Account::new(a.address.clone()))
            .collect();
        let top_accounts: Vec<TopAccount> = chain_accounts
            .iter()
            .map(|a| TopAccount::new(a.address.clone(), a.type_url.clone()))
            .collect();

        log::debug!("Saving {} accounts", accounts.len());
        self.directory.upsert_accounts(&accounts).await?;

        log::debug!("Saving {} top accounts at height {}", top_accounts.len(), height);
        self.directory.upsert_top_accounts(&top_accounts, height).await?;

        Ok(accounts)
    }

    /// Fan out one task per batch and join them all, in batch order
    async fn process_batches(&self, addresses: &[String], height: Height) -> Vec<BatchOutcome> {
        let counter = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = partition_batches(addresses, self.batch_count)
            .into_iter()
            .enumerate()
            .map(|(index, batch)| {
                let batch = batch.to_vec();
                let refresher = self.refresher.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    process_batch(index, batch, height, refresher, counter).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| BatchOutcome {
                    index,
                    refreshed: 0,
                    error: Some(PipelineError::TaskFailed {
                        index,
                        message: e.to_string(),
                    }),
                })
            })
            .collect()
    }
}

async fn process_batch(
    index: usize,
    batch: Vec<String>,
    height: Height,
    refresher: Arc<dyn AccountRefresher>,
    counter: Arc<AtomicUsize>,
) -> BatchOutcome {
    let mut refreshed = 0;

    for address in batch {
        if let Err(e) = refresher.refresh_account(&address, height).await {
            log::error!("Refresh batch {} stopped at {}: {}", index, address, e);
            return BatchOutcome {
                index,
                refreshed,
                error: Some(PipelineError::Batch {
                    index,
                    address,
                    source: Box::new(e),
                }),
            };
        }

        refreshed += 1;
        let total = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if total % 100 == 0 {
            log::info!("Processed {} accounts", total);
        }
    }

    BatchOutcome {
        index,
        refreshed,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_23_into_5() {
        let items: Vec<usize> = (0..23).collect();
        let batches = partition_batches(&items, 5);

        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);

        // Contiguous and each item exactly once
        assert_eq!(batches.concat(), items);
    }

    #[test]
    fn test_partition_fewer_items_than_batches() {
        let items = vec!["a", "b"];
        let batches = partition_batches(&items, 5);
        assert_eq!(batches, vec![&["a"][..], &["b"][..]]);

        let empty: Vec<&str> = Vec::new();
        assert!(partition_batches(&empty, 5).is_empty());
    }

    #[test]
    fn test_partition_even_split() {
        let items: Vec<u8> = (0..10).collect();
        let sizes: Vec<usize> = partition_batches(&items, 5).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 2, 2, 2]);
        assert_eq!(partition_batches(&items, 0).len(), 1);
    }
}
