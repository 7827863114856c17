//! Cosmos-SDK REST (LCD) chain source
//!
//! Endpoints used:
//! - `/cosmos/bank/v1beta1/supply`
//! - `/cosmos/distribution/v1beta1/community_pool`
//! - `/cosmos/auth/v1beta1/accounts[/{address}]`
//! - `/cosmos/bank/v1beta1/spendable_balances/{address}`
//! - `/cosmos/staking/v1beta1/delegations/{address}`
//! - `/cosmos/staking/v1beta1/delegators/{address}/unbonding_delegations`
//! - `/cosmos/staking/v1beta1/params` (bond denomination)
//! - `/cosmos/distribution/v1beta1/delegators/{address}/rewards`
//!
//! Reads are pinned with the `x-cosmos-block-height` header. Paginated
//! endpoints are followed until `next_key` is empty.

use super::ChainSource;
use crate::error::SourceError;
use crate::types::{
    AccountBalance, Amount, ChainAccount, Coin, DecCoin, Height, VestingAccount, VestingKind,
    VestingPeriod, VestingSchedule,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

const HEIGHT_HEADER: &str = "x-cosmos-block-height";
const PAGE_LIMIT: u32 = 1_000;

#[derive(Debug, Deserialize)]
struct RawCoin {
    denom: String,
    amount: String,
}

#[derive(Debug, Deserialize, Default)]
struct Pagination {
    next_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SupplyResponse {
    #[serde(default)]
    supply: Vec<RawCoin>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct CommunityPoolResponse {
    #[serde(default)]
    pool: Vec<RawCoin>,
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account: Value,
}

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    #[serde(default)]
    balances: Vec<RawCoin>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct DelegationEntry {
    balance: RawCoin,
}

#[derive(Debug, Deserialize)]
struct DelegationsResponse {
    #[serde(default)]
    delegation_responses: Vec<DelegationEntry>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct UnbondingEntry {
    balance: String,
}

#[derive(Debug, Deserialize)]
struct UnbondingDelegation {
    #[serde(default)]
    entries: Vec<UnbondingEntry>,
}

#[derive(Debug, Deserialize)]
struct UnbondingResponse {
    #[serde(default)]
    unbonding_responses: Vec<UnbondingDelegation>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct StakingParams {
    bond_denom: String,
}

#[derive(Debug, Deserialize)]
struct StakingParamsResponse {
    params: StakingParams,
}

#[derive(Debug, Deserialize)]
struct RewardsResponse {
    #[serde(default)]
    total: Vec<RawCoin>,
}

fn next_key(pagination: &Option<Pagination>) -> Option<String> {
    pagination
        .as_ref()
        .and_then(|p| p.next_key.clone())
        .filter(|key| !key.is_empty())
}

fn parse_int(op: &'static str, raw: &str) -> Result<Amount, SourceError> {
    raw.parse::<Amount>().map_err(|e| SourceError::Malformed {
        op,
        detail: format!("amount {:?}: {}", raw, e),
    })
}

fn parse_coins(op: &'static str, raw: &[RawCoin]) -> Result<Vec<Coin>, SourceError> {
    raw.iter()
        .map(|c| Ok(Coin::new(c.denom.clone(), parse_int(op, &c.amount)?)))
        .collect()
}

/// Parse an SDK `Dec` string
///
/// SDK decimals carry 18 fractional digits, which can exceed the 28-digit
/// precision of `Decimal`. Fractional digits that do not fit are dropped;
/// callers only ever truncate these amounts toward zero.
pub fn parse_dec(op: &'static str, raw: &str) -> Result<Decimal, SourceError> {
    let raw = raw.trim();
    if let Ok(value) = Decimal::from_str_exact(raw) {
        return Ok(value);
    }

    let (integer, fraction) = raw.split_once('.').unwrap_or((raw, ""));
    let integer_digits = integer.trim_start_matches('-').len();
    let keep = 28usize.saturating_sub(integer_digits).min(fraction.len());
    let candidate = match fraction.get(..keep) {
        Some("") => integer.to_string(),
        Some(kept) => format!("{}.{}", integer, kept),
        None => {
            return Err(malformed(op, format!("decimal {:?} is not ASCII", raw)));
        }
    };

    Decimal::from_str(&candidate).map_err(|e| SourceError::Malformed {
        op,
        detail: format!("decimal {:?}: {}", raw, e),
    })
}

fn parse_dec_coins(op: &'static str, raw: &[RawCoin]) -> Result<Vec<DecCoin>, SourceError> {
    raw.iter()
        .map(|c| Ok(DecCoin::new(c.denom.clone(), parse_dec(op, &c.amount)?)))
        .collect()
}

fn malformed(op: &'static str, detail: impl Into<String>) -> SourceError {
    SourceError::Malformed {
        op,
        detail: detail.into(),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn unix_field(op: &'static str, value: &Value, key: &str) -> Result<DateTime<Utc>, SourceError> {
    // int64 fields are JSON strings in the SDK's REST encoding; absent means 0
    let secs = match value.get(key) {
        None | Some(Value::Null) => 0,
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map_err(|e| malformed(op, format!("{} {:?}: {}", key, s, e)))?,
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| malformed(op, format!("{} {} is not an integer", key, n)))?,
        Some(other) => return Err(malformed(op, format!("{} has unexpected value {}", key, other))),
    };
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| malformed(op, format!("{} {} out of range", key, secs)))
}

fn coins_field(op: &'static str, value: &Value, key: &str) -> Result<Vec<Coin>, SourceError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw) => {
            let coins: Vec<RawCoin> = serde_json::from_value(raw.clone())
                .map_err(|e| malformed(op, format!("{}: {}", key, e)))?;
            parse_coins(op, &coins)
        }
    }
}

/// Decode one JSON-encoded `Any` account into a `ChainAccount`
///
/// Vesting accounts nest their address under
/// `base_vesting_account.base_account`, module accounts under `base_account`.
pub fn decode_account(op: &'static str, any: &Value) -> Result<ChainAccount, SourceError> {
    let type_url = str_field(any, "@type")
        .ok_or_else(|| malformed(op, "account without @type"))?
        .to_string();

    let base_vesting = any.get("base_vesting_account");
    let base_account = base_vesting
        .and_then(|bva| bva.get("base_account"))
        .or_else(|| any.get("base_account"))
        .unwrap_or(any);
    let address = str_field(base_account, "address")
        .ok_or_else(|| malformed(op, format!("{} without address", type_url)))?
        .to_string();

    let kind = match (VestingKind::from_type_name(&type_url), base_vesting) {
        (Some(kind), Some(bva)) => Some((kind, bva)),
        _ => None,
    };
    let Some((kind, bva)) = kind else {
        return Ok(ChainAccount::plain(address, type_url));
    };

    let schedule = VestingSchedule {
        address,
        original_vesting: coins_field(op, bva, "original_vesting")?,
        // Delayed accounts have no start time and unlock at the end time
        start_time: unix_field(op, any, "start_time")?,
        end_time: unix_field(op, bva, "end_time")?,
    };

    let account = match kind {
        VestingKind::Continuous => VestingAccount::Continuous(schedule),
        VestingKind::Delayed => VestingAccount::Delayed(schedule),
        VestingKind::Periodic => {
            let periods = match any.get("vesting_periods") {
                Some(Value::Array(raw)) => raw
                    .iter()
                    .map(|period| {
                        let length_seconds = match period.get("length") {
                            Some(Value::String(s)) => s.parse::<i64>().ok(),
                            Some(Value::Number(n)) => n.as_i64(),
                            _ => None,
                        }
                        .ok_or_else(|| malformed(op, "vesting period without length"))?;
                        Ok(VestingPeriod {
                            length_seconds,
                            amount: coins_field(op, period, "amount")?,
                        })
                    })
                    .collect::<Result<Vec<_>, SourceError>>()?,
                _ => Vec::new(),
            };
            VestingAccount::Periodic { schedule, periods }
        }
    };

    Ok(ChainAccount::vesting(type_url, account))
}

/// REST client for a Cosmos-SDK node
pub struct RestChainSource {
    client: reqwest::Client,
    base_url: String,
}

impl RestChainSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| SourceError::Http {
                op: "building HTTP client",
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// GET `path` at `height`; `Ok(None)` on 404
    async fn get<T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
        height: Height,
        query: &[(&str, String)],
    ) -> Result<Option<T>, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header(HEIGHT_HEADER, height.to_string())
            .query(query)
            .send()
            .await
            .map_err(|source| SourceError::Http { op, source })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                op,
                status: status.as_u16(),
            });
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|source| SourceError::Http { op, source })?;
        Ok(Some(body))
    }

    async fn get_required<T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
        height: Height,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        self.get(op, path, height, query)
            .await?
            .ok_or(SourceError::Status { op, status: 404 })
    }

    /// Staking bond denomination, for balances reported without one
    async fn bond_denom_at(&self, height: Height) -> Result<String, SourceError> {
        let response: StakingParamsResponse = self
            .get_required("getting staking params", "/cosmos/staking/v1beta1/params", height, &[])
            .await?;
        Ok(response.params.bond_denom)
    }

    fn page_query(key: &Option<String>) -> Vec<(&'static str, String)> {
        let mut query = vec![("pagination.limit", PAGE_LIMIT.to_string())];
        if let Some(key) = key {
            query.push(("pagination.key", key.clone()));
        }
        query
    }
}

#[async_trait]
impl ChainSource for RestChainSource {
    async fn total_supply_at(&self, height: Height) -> Result<Vec<Coin>, SourceError> {
        const OP: &str = "getting total supply";
        let mut coins = Vec::new();
        let mut key = None;

        loop {
            let page: SupplyResponse = self
                .get_required(OP, "/cosmos/bank/v1beta1/supply", height, &Self::page_query(&key))
                .await?;
            coins.extend(parse_coins(OP, &page.supply)?);
            key = next_key(&page.pagination);
            if key.is_none() {
                break;
            }
        }

        Ok(coins)
    }

    async fn community_pool_at(&self, height: Height) -> Result<Vec<DecCoin>, SourceError> {
        const OP: &str = "getting community pool";
        let response: CommunityPoolResponse = self
            .get_required(OP, "/cosmos/distribution/v1beta1/community_pool", height, &[])
            .await?;
        parse_dec_coins(OP, &response.pool)
    }

    async fn enumerate_accounts(&self, height: Height) -> Result<Vec<ChainAccount>, SourceError> {
        const OP: &str = "getting all accounts";
        let mut accounts = Vec::new();
        let mut key = None;

        loop {
            let page: AccountsResponse = self
                .get_required(OP, "/cosmos/auth/v1beta1/accounts", height, &Self::page_query(&key))
                .await?;
            for any in &page.accounts {
                accounts.push(decode_account(OP, any)?);
            }
            key = next_key(&page.pagination);
            if key.is_none() {
                break;
            }
            log::debug!("Fetched {} accounts so far", accounts.len());
        }

        Ok(accounts)
    }

    async fn account_at(
        &self,
        address: &str,
        height: Height,
    ) -> Result<Option<ChainAccount>, SourceError> {
        const OP: &str = "getting account";
        let path = format!("/cosmos/auth/v1beta1/accounts/{}", address);
        let response: Option<AccountResponse> = self.get(OP, &path, height, &[]).await?;
        response
            .map(|r| decode_account(OP, &r.account))
            .transpose()
    }

    async fn balance_at(
        &self,
        address: &str,
        height: Height,
    ) -> Result<AccountBalance, SourceError> {
        let mut balance = AccountBalance::default();

        const SPENDABLE: &str = "getting spendable balances";
        let path = format!("/cosmos/bank/v1beta1/spendable_balances/{}", address);
        let mut key = None;
        loop {
            let page: BalancesResponse = self
                .get_required(SPENDABLE, &path, height, &Self::page_query(&key))
                .await?;
            balance.available.extend(parse_coins(SPENDABLE, &page.balances)?);
            key = next_key(&page.pagination);
            if key.is_none() {
                break;
            }
        }

        const DELEGATIONS: &str = "getting delegations";
        let path = format!("/cosmos/staking/v1beta1/delegations/{}", address);
        let mut key = None;
        loop {
            let Some(page) = self
                .get::<DelegationsResponse>(DELEGATIONS, &path, height, &Self::page_query(&key))
                .await?
            else {
                break;
            };
            for entry in &page.delegation_responses {
                balance.delegated.push(Coin::new(
                    entry.balance.denom.clone(),
                    parse_int(DELEGATIONS, &entry.balance.amount)?,
                ));
            }
            key = next_key(&page.pagination);
            if key.is_none() {
                break;
            }
        }

        // Unbonding entries carry bare amounts of the bond denomination
        const UNBONDING: &str = "getting unbonding delegations";
        let path = format!(
            "/cosmos/staking/v1beta1/delegators/{}/unbonding_delegations",
            address
        );
        let mut bond_denom = balance.delegated.first().map(|c| c.denom.clone());
        let mut key = None;
        loop {
            let Some(page) = self
                .get::<UnbondingResponse>(UNBONDING, &path, height, &Self::page_query(&key))
                .await?
            else {
                break;
            };
            for unbonding in &page.unbonding_responses {
                for entry in &unbonding.entries {
                    let denom = match bond_denom.clone() {
                        Some(denom) => denom,
                        None => {
                            let denom = self.bond_denom_at(height).await?;
                            bond_denom = Some(denom.clone());
                            denom
                        }
                    };
                    balance
                        .unbonding
                        .push(Coin::new(denom, parse_int(UNBONDING, &entry.balance)?));
                }
            }
            key = next_key(&page.pagination);
            if key.is_none() {
                break;
            }
        }

        const REWARDS: &str = "getting delegator rewards";
        let path = format!("/cosmos/distribution/v1beta1/delegators/{}/rewards", address);
        if let Some(rewards) = self.get::<RewardsResponse>(REWARDS, &path, height, &[]).await? {
            balance.rewards = parse_dec_coins(REWARDS, &rewards.total)?;
        }

        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_dec_with_sdk_precision() {
        let value = parse_dec("test", "30000.123456789012345678").unwrap();
        assert_eq!(crate::types::truncate_to_amount(value), 30_000);

        // 20 integer digits + 18 fractional digits does not fit in a Decimal
        let value = parse_dec("test", "12345678901234567890.123456789012345678").unwrap();
        assert_eq!(
            crate::types::truncate_to_amount(value),
            12_345_678_901_234_567_890
        );

        assert!(parse_dec("test", "abc").is_err());
    }

    #[test]
    fn test_parse_dec_rejects_non_ascii_fraction() {
        let raw = format!("1.{}", "é".repeat(20));
        assert!(matches!(
            parse_dec("test", &raw),
            Err(SourceError::Malformed { .. })
        ));
        assert!(matches!(
            parse_dec("test", "1.é"),
            Err(SourceError::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_base_and_module_accounts() {
        let base = json!({
            "@type": "/cosmos.auth.v1beta1.BaseAccount",
            "address": "empe1base",
            "pub_key": null,
            "account_number": "1",
            "sequence": "0"
        });
        let account = decode_account("test", &base).unwrap();
        assert_eq!(account.address, "empe1base");
        assert!(account.vesting.is_none());

        let module = json!({
            "@type": "/cosmos.auth.v1beta1.ModuleAccount",
            "base_account": {"address": "empe1module"},
            "name": "distribution",
            "permissions": []
        });
        let account = decode_account("test", &module).unwrap();
        assert_eq!(account.address, "empe1module");
        assert_eq!(account.type_url, "/cosmos.auth.v1beta1.ModuleAccount");
    }

    #[test]
    fn test_decode_periodic_vesting_account() {
        let periodic = json!({
            "@type": "/cosmos.vesting.v1beta1.PeriodicVestingAccount",
            "base_vesting_account": {
                "base_account": {"address": "empe1vest"},
                "original_vesting": [{"denom": "uempe", "amount": "1000"}],
                "delegated_free": [],
                "delegated_vesting": [],
                "end_time": "1700000200"
            },
            "start_time": "1700000000",
            "vesting_periods": [
                {"length": "100", "amount": [{"denom": "uempe", "amount": "500"}]},
                {"length": "100", "amount": [{"denom": "uempe", "amount": "500"}]}
            ]
        });

        let account = decode_account("test", &periodic).unwrap();
        let vesting = account.vesting.unwrap();
        assert_eq!(vesting.kind(), VestingKind::Periodic);
        assert_eq!(vesting.address(), "empe1vest");
        assert_eq!(vesting.schedule().original_vesting, vec![Coin::new("uempe", 1_000)]);
        assert_eq!(vesting.schedule().start_time.timestamp(), 1_700_000_000);
        assert_eq!(vesting.schedule().end_time.timestamp(), 1_700_000_200);
        assert_eq!(vesting.periods().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_delayed_vesting_without_start() {
        let delayed = json!({
            "@type": "/cosmos.vesting.v1beta1.DelayedVestingAccount",
            "base_vesting_account": {
                "base_account": {"address": "empe1delay"},
                "original_vesting": [{"denom": "uempe", "amount": "42"}],
                "end_time": "1700000000"
            }
        });

        let vesting = decode_account("test", &delayed).unwrap().vesting.unwrap();
        assert_eq!(vesting.kind(), VestingKind::Delayed);
        assert_eq!(vesting.schedule().start_time.timestamp(), 0);
    }

    #[test]
    fn test_decode_rejects_untyped_account() {
        assert!(decode_account("test", &json!({"address": "x"})).is_err());
    }
}
