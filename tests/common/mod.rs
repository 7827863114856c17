//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use supplyflow::db::{BlockIndex, SqliteStore};
use supplyflow::error::{PipelineError, SourceError};
use supplyflow::refresh::AccountRefresher;
use supplyflow::source::ChainSource;
use supplyflow::types::{
    AccountBalance, ChainAccount, Coin, DecCoin, Height, LatestBlock,
};

pub const DENOM: &str = "uempe";
pub const BASE_ACCOUNT: &str = "/cosmos.auth.v1beta1.BaseAccount";
pub const MODULE_ACCOUNT: &str = "/cosmos.auth.v1beta1.ModuleAccount";

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Fresh in-memory store with one indexed block
pub async fn store_at(height: Height, timestamp: DateTime<Utc>) -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .save_block(&LatestBlock { height, timestamp })
        .await
        .unwrap();
    store
}

/// `addr01`, `addr02`, ... in enumeration order
pub fn addresses(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("addr{:02}", i)).collect()
}

#[derive(Default)]
struct ChainState {
    supply: Vec<Coin>,
    community_pool: Vec<DecCoin>,
    accounts: Vec<ChainAccount>,
    balances: HashMap<String, AccountBalance>,
    failing: HashSet<String>,
    queried_heights: Vec<Height>,
}

/// In-memory chain: fixed state, answers every height the same way and
/// records which heights were asked for
#[derive(Default, Clone)]
pub struct StaticChainSource {
    state: Arc<Mutex<ChainState>>,
}

impl StaticChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_supply(self, amount: i128) -> Self {
        self.state.lock().unwrap().supply =
            vec![Coin::new(DENOM, amount), Coin::new("uother", 5)];
        self
    }

    pub fn with_community_pool(self, amount: &str) -> Self {
        self.state.lock().unwrap().community_pool =
            vec![DecCoin::new(DENOM, amount.parse().unwrap())];
        self
    }

    pub fn with_account(self, account: ChainAccount) -> Self {
        self.state.lock().unwrap().accounts.push(account);
        self
    }

    pub fn with_balance(self, address: &str, balance: AccountBalance) -> Self {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(address.to_string(), balance);
        self
    }

    /// `account_at` and `balance_at` fail for this address
    pub fn failing_on(self, address: &str) -> Self {
        self.state.lock().unwrap().failing.insert(address.to_string());
        self
    }

    pub fn queried_heights(&self) -> Vec<Height> {
        self.state.lock().unwrap().queried_heights.clone()
    }

    fn record(&self, height: Height) {
        self.state.lock().unwrap().queried_heights.push(height);
    }

    fn check_failing(&self, op: &'static str, address: &str) -> Result<(), SourceError> {
        if self.state.lock().unwrap().failing.contains(address) {
            return Err(SourceError::Malformed {
                op,
                detail: format!("injected failure for {}", address),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for StaticChainSource {
    async fn total_supply_at(&self, height: Height) -> Result<Vec<Coin>, SourceError> {
        self.record(height);
        Ok(self.state.lock().unwrap().supply.clone())
    }

    async fn community_pool_at(&self, height: Height) -> Result<Vec<DecCoin>, SourceError> {
        self.record(height);
        Ok(self.state.lock().unwrap().community_pool.clone())
    }

    async fn enumerate_accounts(&self, height: Height) -> Result<Vec<ChainAccount>, SourceError> {
        self.record(height);
        Ok(self.state.lock().unwrap().accounts.clone())
    }

    async fn account_at(
        &self,
        address: &str,
        height: Height,
    ) -> Result<Option<ChainAccount>, SourceError> {
        self.record(height);
        self.check_failing("querying account", address)?;
        let state = self.state.lock().unwrap();
        Ok(state.accounts.iter().find(|a| a.address == address).cloned())
    }

    async fn balance_at(
        &self,
        address: &str,
        height: Height,
    ) -> Result<AccountBalance, SourceError> {
        self.record(height);
        self.check_failing("querying balances", address)?;
        let state = self.state.lock().unwrap();
        Ok(state.balances.get(address).cloned().unwrap_or_default())
    }
}

/// Refresher that records every attempt and fails on chosen addresses
#[derive(Default)]
pub struct RecordingRefresher {
    failing: HashSet<String>,
    attempted: Mutex<Vec<String>>,
    refreshed: Mutex<Vec<String>>,
}

impl RecordingRefresher {
    pub fn failing_on(addresses: &[&str]) -> Self {
        Self {
            failing: addresses.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> Vec<String> {
        self.attempted.lock().unwrap().clone()
    }

    pub fn refreshed(&self) -> Vec<String> {
        self.refreshed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountRefresher for RecordingRefresher {
    async fn refresh_account(&self, address: &str, _height: Height) -> Result<(), PipelineError> {
        self.attempted.lock().unwrap().push(address.to_string());
        if self.failing.contains(address) {
            return Err(PipelineError::Source(SourceError::Malformed {
                op: "refreshing account",
                detail: format!("injected failure for {}", address),
            }));
        }
        // Give other batches a chance to interleave
        tokio::task::yield_now().await;
        self.refreshed.lock().unwrap().push(address.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
