//! Core data structures shared by the ledger, the aggregators and the refresh pipeline
//!
//! Amounts are whole base units of a denomination and are carried as `i128`
//! so that no supply figure is limited to 64 bits. Stored rows keep them as
//! base-10 TEXT (see `db::sqlite`).

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Integer amount in base units (e.g. `uempe`)
pub type Amount = i128;

/// Block height as stored by the indexer
pub type Height = i64;

/// A whole-unit coin amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Amount,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: Amount) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// A decimal coin amount (community pool, delegator rewards)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecCoin {
    pub denom: String,
    pub amount: Decimal,
}

impl DecCoin {
    pub fn new(denom: impl Into<String>, amount: Decimal) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// Sum of all coins of `denom`. Absent denominations count as zero.
pub fn amount_of(coins: &[Coin], denom: &str) -> Result<Amount, PipelineError> {
    coins
        .iter()
        .filter(|c| c.denom == denom)
        .try_fold(0 as Amount, |acc, c| acc.checked_add(c.amount))
        .ok_or(PipelineError::Overflow("coin amount"))
}

/// Sum of all decimal coins of `denom`
pub fn dec_amount_of(coins: &[DecCoin], denom: &str) -> Result<Decimal, PipelineError> {
    coins
        .iter()
        .filter(|c| c.denom == denom)
        .try_fold(Decimal::ZERO, |acc, c| acc.checked_add(c.amount))
        .ok_or(PipelineError::Overflow("decimal coin amount"))
}

/// A known account address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
}

impl Account {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

/// Snapshot-time classification of an account by its concrete on-chain type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopAccount {
    pub address: String,
    pub type_url: String,
}

impl TopAccount {
    pub fn new(address: impl Into<String>, type_url: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            type_url: type_url.into(),
        }
    }
}

/// Balance columns of a top-accounts row, restricted to one denomination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopAccountBalance {
    pub available: Amount,
    pub delegation: Amount,
    pub unbonding: Amount,
    pub reward: Amount,
}

impl TopAccountBalance {
    /// Total holdings used by the per-type aggregate queries
    /// `None` if the total does not fit in an `Amount`
    pub fn sum(&self) -> Option<Amount> {
        self.available
            .checked_add(self.delegation)?
            .checked_add(self.unbonding)?
            .checked_add(self.reward)
    }
}

/// Everything an account holds, as reported by the chain source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub available: Vec<Coin>,
    pub delegated: Vec<Coin>,
    pub unbonding: Vec<Coin>,
    pub rewards: Vec<DecCoin>,
}

impl AccountBalance {
    /// Project onto one denomination. Rewards are truncated toward zero.
    pub fn project(&self, denom: &str) -> Result<TopAccountBalance, PipelineError> {
        Ok(TopAccountBalance {
            available: amount_of(&self.available, denom)?,
            delegation: amount_of(&self.delegated, denom)?,
            unbonding: amount_of(&self.unbonding, denom)?,
            reward: truncate_to_amount(dec_amount_of(&self.rewards, denom)?),
        })
    }
}

/// Truncate a decimal toward zero into whole base units
pub fn truncate_to_amount(value: Decimal) -> Amount {
    // Decimal's mantissa is 96 bits, so the truncated value always fits in i128
    value.trunc().mantissa()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VestingKind {
    Continuous,
    Delayed,
    Periodic,
}

impl VestingKind {
    /// Protobuf message name used as the stored `type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            VestingKind::Continuous => "cosmos.vesting.v1beta1.ContinuousVestingAccount",
            VestingKind::Delayed => "cosmos.vesting.v1beta1.DelayedVestingAccount",
            VestingKind::Periodic => "cosmos.vesting.v1beta1.PeriodicVestingAccount",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name.trim_start_matches('/') {
            "cosmos.vesting.v1beta1.ContinuousVestingAccount" => Some(VestingKind::Continuous),
            "cosmos.vesting.v1beta1.DelayedVestingAccount" => Some(VestingKind::Delayed),
            "cosmos.vesting.v1beta1.PeriodicVestingAccount" => Some(VestingKind::Periodic),
            _ => None,
        }
    }
}

/// One step of a periodic unlock schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingPeriod {
    pub length_seconds: i64,
    pub amount: Vec<Coin>,
}

/// The schedule shared by every vesting kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingSchedule {
    pub address: String,
    pub original_vesting: Vec<Coin>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// A vesting account: the common schedule plus, for periodic accounts,
/// the ordered period list (kept for inspection only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VestingAccount {
    Continuous(VestingSchedule),
    Delayed(VestingSchedule),
    Periodic {
        schedule: VestingSchedule,
        periods: Vec<VestingPeriod>,
    },
}

impl VestingAccount {
    pub fn kind(&self) -> VestingKind {
        match self {
            VestingAccount::Continuous(_) => VestingKind::Continuous,
            VestingAccount::Delayed(_) => VestingKind::Delayed,
            VestingAccount::Periodic { .. } => VestingKind::Periodic,
        }
    }

    pub fn schedule(&self) -> &VestingSchedule {
        match self {
            VestingAccount::Continuous(schedule) | VestingAccount::Delayed(schedule) => schedule,
            VestingAccount::Periodic { schedule, .. } => schedule,
        }
    }

    pub fn address(&self) -> &str {
        &self.schedule().address
    }

    pub fn periods(&self) -> Option<&[VestingPeriod]> {
        match self {
            VestingAccount::Periodic { periods, .. } => Some(periods),
            _ => None,
        }
    }
}

/// An account record as enumerated from the chain source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAccount {
    pub address: String,
    pub type_url: String,
    pub vesting: Option<VestingAccount>,
}

impl ChainAccount {
    pub fn plain(address: impl Into<String>, type_url: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            type_url: type_url.into(),
            vesting: None,
        }
    }

    pub fn vesting(type_url: impl Into<String>, account: VestingAccount) -> Self {
        Self {
            address: account.address().to_string(),
            type_url: type_url.into(),
            vesting: Some(account),
        }
    }
}

/// Latest locally indexed block; anchors every aggregation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestBlock {
    pub height: Height,
    pub timestamp: DateTime<Utc>,
}

/// Key/value attribute of a transaction event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

/// Indexed transaction: the fee it paid and the events it emitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedTransaction {
    pub hash: String,
    pub height: Height,
    pub fee: Vec<Coin>,
    pub events: Vec<TxEvent>,
}
