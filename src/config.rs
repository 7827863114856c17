//! Runtime configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the supply runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct SupplyConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// REST endpoint of the chain node
    pub chain_rest_url: String,

    /// Native denomination every metric is restricted to
    pub denom: String,

    /// Base-unit to display-unit exponent (6 => 1_000_000 base units per token)
    pub display_exponent: u32,

    /// Type URL identifying module accounts in the top-accounts snapshot
    pub module_account_type: String,

    /// Event type emitted when a stable fee is charged
    pub stable_fee_event_type: String,

    /// Attribute of the stable fee event carrying the charged amount
    pub stable_fee_attribute_key: String,

    /// Number of concurrent batches in the account refresh pipeline
    pub refresh_batch_count: usize,

    pub supply_interval: Duration,
    pub fees_interval: Duration,
    pub top_accounts_interval: Duration,

    /// HTTP timeout for chain source requests
    pub source_timeout: Duration,
}

impl Default for SupplyConfig {
    fn default() -> Self {
        Self {
            db_path: "supplyflow.db".to_string(),
            chain_rest_url: "http://localhost:1317".to_string(),
            denom: "uempe".to_string(),
            display_exponent: 6,
            module_account_type: "/cosmos.auth.v1beta1.ModuleAccount".to_string(),
            stable_fee_event_type: "empe.stablefee.EventChargeFee".to_string(),
            stable_fee_attribute_key: "uempeAmount".to_string(),
            refresh_batch_count: 5,
            supply_interval: Duration::from_secs(13 * 60 * 60),
            fees_interval: Duration::from_secs(6 * 60 * 60),
            top_accounts_interval: Duration::from_secs(12 * 60 * 60),
            source_timeout: Duration::from_secs(30),
        }
    }
}

impl SupplyConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `SUPPLYFLOW_DB_PATH` (default: supplyflow.db)
    /// - `CHAIN_REST_URL` (default: http://localhost:1317)
    /// - `NATIVE_DENOM` (default: uempe)
    /// - `DISPLAY_EXPONENT` (default: 6, at most 28)
    /// - `MODULE_ACCOUNT_TYPE` (default: /cosmos.auth.v1beta1.ModuleAccount)
    /// - `STABLE_FEE_EVENT_TYPE` (default: empe.stablefee.EventChargeFee)
    /// - `STABLE_FEE_ATTRIBUTE_KEY` (default: uempeAmount)
    /// - `REFRESH_BATCH_COUNT` (default: 5)
    /// - `SUPPLY_INTERVAL_SECS` (default: 46800)
    /// - `FEES_INTERVAL_SECS` (default: 21600)
    /// - `TOP_ACCOUNTS_INTERVAL_SECS` (default: 43200)
    /// - `SOURCE_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_path: env::var("SUPPLYFLOW_DB_PATH").unwrap_or(defaults.db_path),

            chain_rest_url: env::var("CHAIN_REST_URL").unwrap_or(defaults.chain_rest_url),

            denom: env::var("NATIVE_DENOM").unwrap_or(defaults.denom),

            // Display amounts are decimals, which carry at most 28 fractional digits
            display_exponent: parsed("DISPLAY_EXPONENT")
                .filter(|e: &u32| *e <= 28)
                .unwrap_or(defaults.display_exponent),

            module_account_type: env::var("MODULE_ACCOUNT_TYPE")
                .unwrap_or(defaults.module_account_type),

            stable_fee_event_type: env::var("STABLE_FEE_EVENT_TYPE")
                .unwrap_or(defaults.stable_fee_event_type),

            stable_fee_attribute_key: env::var("STABLE_FEE_ATTRIBUTE_KEY")
                .unwrap_or(defaults.stable_fee_attribute_key),

            // A zero batch count would never refresh anything
            refresh_batch_count: parsed("REFRESH_BATCH_COUNT")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.refresh_batch_count),

            // Zero intervals and timeouts fall back to the default as well
            supply_interval: seconds("SUPPLY_INTERVAL_SECS").unwrap_or(defaults.supply_interval),

            fees_interval: seconds("FEES_INTERVAL_SECS").unwrap_or(defaults.fees_interval),

            top_accounts_interval: seconds("TOP_ACCOUNTS_INTERVAL_SECS")
                .unwrap_or(defaults.top_accounts_interval),

            source_timeout: seconds("SOURCE_TIMEOUT_SECS").unwrap_or(defaults.source_timeout),
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn seconds(key: &str) -> Option<Duration> {
    parsed(key).filter(|secs: &u64| *secs > 0).map(Duration::from_secs)
}
