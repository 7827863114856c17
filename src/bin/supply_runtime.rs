//! Supply Runtime
//!
//! Opens the SQLite store, connects to the chain REST endpoint and runs the
//! three periodic jobs until CTRL+C:
//! - circulating supply
//! - collected fees
//! - top accounts refresh (vesting schedules and balances)
//!
//! Usage:
//!   cargo run --release --bin supply_runtime
//!
//! Environment variables: see `SupplyConfig::from_env`.

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use supplyflow::db::{AccountDirectory, BlockIndex, MetricsStore, VestingStore};
use supplyflow::refresh::{BalanceRefresher, VestingRefresher};
use supplyflow::scheduler::spawn_periodic;
use supplyflow::{
    AccountRefreshPipeline, AccountRefresher, ChainSource, FeeAggregator, PipelineError,
    RefresherChain, RestChainSource, SqliteStore, StableFeeEvent, SupplyAggregator, SupplyConfig,
    VestingLedger,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Supply Runtime");

    let config = SupplyConfig::from_env();
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Chain REST: {}", config.chain_rest_url);
    info!("   ├─ Denom: {} (exponent {})", config.denom, config.display_exponent);
    info!("   └─ Refresh batches: {}", config.refresh_batch_count);

    let store = SqliteStore::open(&config.db_path)?;
    info!("✅ Database initialized");

    let source: Arc<dyn ChainSource> = Arc::new(RestChainSource::new(
        config.chain_rest_url.clone(),
        config.source_timeout,
    )?);

    let blocks: Arc<dyn BlockIndex> = Arc::new(store.clone());
    let directory: Arc<dyn AccountDirectory> = Arc::new(store.clone());
    let metrics: Arc<dyn MetricsStore> = Arc::new(store.clone());
    let vesting_store: Arc<dyn VestingStore> = Arc::new(store);

    let ledger = VestingLedger::new(vesting_store, config.denom.clone());

    let vesting_refresher: Arc<dyn AccountRefresher> =
        Arc::new(VestingRefresher::new(source.clone(), ledger.clone()));
    let balance_refresher: Arc<dyn AccountRefresher> = Arc::new(BalanceRefresher::new(
        source.clone(),
        directory.clone(),
        config.denom.clone(),
    ));
    let refresher: Arc<dyn AccountRefresher> =
        Arc::new(RefresherChain::new(vec![vesting_refresher, balance_refresher]));

    let refresh_pipeline = Arc::new(AccountRefreshPipeline::new(
        blocks.clone(),
        source.clone(),
        directory.clone(),
        refresher,
        config.refresh_batch_count,
    ));
    let supply = Arc::new(SupplyAggregator::new(
        blocks.clone(),
        ledger,
        directory,
        metrics.clone(),
        source,
        config.module_account_type.clone(),
    ));
    let fees = Arc::new(FeeAggregator::new(
        blocks,
        metrics,
        config.denom.clone(),
        StableFeeEvent {
            event_type: config.stable_fee_event_type.clone(),
            attribute_key: config.stable_fee_attribute_key.clone(),
        },
    ));

    info!("🚀 Spawning periodic jobs...");
    let display_exponent = config.display_exponent;
    let handles = vec![
        spawn_periodic("circulating supply", config.supply_interval, move || {
            let supply = supply.clone();
            async move {
                supply.update_circulating_supply().await?;
                let tokens = supply.latest_circulating_supply_display(display_exponent).await?;
                info!("📊 Circulating supply: {} tokens", tokens);
                Ok::<(), PipelineError>(())
            }
        }),
        spawn_periodic("collected fees", config.fees_interval, move || {
            let fees = fees.clone();
            async move { fees.update_collected_fees().await }
        }),
        spawn_periodic("top accounts", config.top_accounts_interval, move || {
            let pipeline = refresh_pipeline.clone();
            async move { pipeline.refresh_all_accounts().await }
        }),
    ];
    info!("✅ All jobs running");
    info!("🔄 Press CTRL+C to shutdown");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    for handle in handles {
        handle.abort();
    }

    info!("✅ Supply runtime stopped");
    Ok(())
}
