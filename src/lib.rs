//! Circulating supply and collected fees aggregation for a Cosmos SDK chain
//!
//! - `vesting`: locked amount of every vesting schedule at a block time
//! - `refresh`: batched, concurrent re-read of every account's derived state
//! - `supply`: `total - locked - module accounts - community pool`
//! - `fees`: incremental fee totals over indexed transactions
//! - `scheduler`: periodic background jobs

pub mod config;
pub mod db;
pub mod error;
pub mod fees;
pub mod refresh;
pub mod scheduler;
pub mod source;
pub mod supply;
pub mod types;
pub mod vesting;

pub use config::SupplyConfig;
pub use db::SqliteStore;
pub use error::{PipelineError, SourceError, StoreError};
pub use fees::{FeeAggregator, StableFeeEvent};
pub use refresh::{AccountRefreshPipeline, AccountRefresher, RefresherChain};
pub use source::{ChainSource, RestChainSource};
pub use supply::SupplyAggregator;
pub use vesting::VestingLedger;
