//! Vesting ledger: stores vesting schedules and computes the amount still locked
//!
//! Every vesting kind unlocks linearly between `start_time` and `end_time`:
//!
//! ```text
//! t <= start           locked = original
//! t >= end             locked = 0
//! otherwise            locked = original - round(original * (t - start) / (end - start))
//! ```
//!
//! Rounding is half-up on whole base units. Periods of periodic accounts are
//! stored for inspection but do not change the formula.

use crate::db::VestingStore;
use crate::error::{PipelineError, StoreError};
use crate::types::{amount_of, Amount, VestingAccount, VestingSchedule};
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};
use std::sync::Arc;

/// Amount of `original` still locked at `at` for a schedule running from `start` to `end`
///
/// Timestamps are compared at millisecond resolution. A zero-length schedule
/// is fully unlocked from its end time on.
pub fn locked_amount_at(
    original: Amount,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<Amount, PipelineError> {
    if at >= end {
        return Ok(0);
    }
    if at <= start {
        return Ok(original);
    }

    // start < at < end here, so the duration is strictly positive
    let elapsed = BigInt::from(at.timestamp_millis() - start.timestamp_millis());
    let duration = BigInt::from(end.timestamp_millis() - start.timestamp_millis());
    let original_big = BigInt::from(original);

    let vested = round_half_up_div(&(original_big.clone() * elapsed), &duration);
    (original_big - vested)
        .to_i128()
        .ok_or(PipelineError::Overflow("locked vesting amount"))
}

/// `numerator / denominator` rounded half away from zero; `denominator > 0`
fn round_half_up_div(numerator: &BigInt, denominator: &BigInt) -> BigInt {
    let two = BigInt::from(2);
    let twice = numerator * &two;
    let scaled_denominator = denominator * &two;
    if twice >= BigInt::zero() {
        (twice + denominator) / scaled_denominator
    } else {
        (twice - denominator) / scaled_denominator
    }
}

/// Locked amount of one schedule in `denom`
pub fn schedule_locked_at(
    schedule: &VestingSchedule,
    denom: &str,
    at: DateTime<Utc>,
) -> Result<Amount, PipelineError> {
    locked_amount_at(
        amount_of(&schedule.original_vesting, denom)?,
        schedule.start_time,
        schedule.end_time,
        at,
    )
}

/// Vesting ledger bound to one denomination
#[derive(Clone)]
pub struct VestingLedger {
    store: Arc<dyn VestingStore>,
    denom: String,
}

impl VestingLedger {
    pub fn new(store: Arc<dyn VestingStore>, denom: impl Into<String>) -> Self {
        Self {
            store,
            denom: denom.into(),
        }
    }

    pub fn denom(&self) -> &str {
        &self.denom
    }

    /// Store/update a vesting account (periods replaced atomically)
    pub async fn upsert_vesting_account(&self, account: &VestingAccount) -> Result<(), StoreError> {
        self.store.upsert_vesting_account(account).await
    }

    /// Sum, over every stored vesting account, of the amount locked at `at`
    pub async fn sum_locked_at(&self, at: DateTime<Utc>) -> Result<Amount, PipelineError> {
        let accounts = self.store.vesting_accounts().await?;

        let mut total: Amount = 0;
        for account in &accounts {
            let locked = schedule_locked_at(account.schedule(), &self.denom, at)?;
            total = total
                .checked_add(locked)
                .ok_or(PipelineError::Overflow("locked vesting sum"))?;
        }

        log::debug!(
            "Locked vesting at {}: {} {} across {} accounts",
            at,
            total,
            self.denom,
            accounts.len()
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::types::{Coin, VestingPeriod};
    use chrono::{Duration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn schedule(address: &str, amount: Amount, start: i64, end: i64) -> VestingSchedule {
        VestingSchedule {
            address: address.to_string(),
            original_vesting: vec![Coin::new("uempe", amount), Coin::new("uother", 77)],
            start_time: ts(start),
            end_time: ts(end),
        }
    }

    #[test]
    fn test_locked_before_start_is_original() {
        for at in [0, 500, 999, 1_000] {
            assert_eq!(locked_amount_at(1_234, ts(1_000), ts(2_000), ts(at)).unwrap(), 1_234);
        }
    }

    #[test]
    fn test_locked_after_end_is_zero() {
        for at in [2_000, 2_001, 1_000_000] {
            assert_eq!(locked_amount_at(1_234, ts(1_000), ts(2_000), ts(at)).unwrap(), 0);
        }
    }

    #[test]
    fn test_locked_is_non_increasing() {
        let start = ts(1_000);
        let end = ts(1_000 + 997);
        let mut previous = locked_amount_at(1_000_003, start, end, start).unwrap();
        let mut at = start;
        while at <= end {
            let locked = locked_amount_at(1_000_003, start, end, at).unwrap();
            assert!(locked <= previous, "locked went up at {}", at);
            previous = locked;
            at = at + Duration::milliseconds(7_919);
        }
        assert_eq!(locked_amount_at(1_000_003, start, end, end).unwrap(), 0);
    }

    #[test]
    fn test_linear_rounding_half_up() {
        // 3 * 1/2 = 1.5 vested -> rounds to 2, so 1 stays locked
        assert_eq!(locked_amount_at(3, ts(0), ts(2), ts(1)).unwrap(), 1);
        // 10 * 1/3 = 3.33 vested -> 3, so 7 stays locked
        assert_eq!(locked_amount_at(10, ts(0), ts(3), ts(1)).unwrap(), 7);
        // 10 * 2/3 = 6.67 vested -> 7, so 3 stays locked
        assert_eq!(locked_amount_at(10, ts(0), ts(3), ts(2)).unwrap(), 3);
    }

    #[test]
    fn test_zero_length_schedule() {
        assert_eq!(locked_amount_at(500, ts(10), ts(10), ts(10)).unwrap(), 0);
        assert_eq!(locked_amount_at(500, ts(10), ts(10), ts(11)).unwrap(), 0);
        assert_eq!(locked_amount_at(500, ts(10), ts(10), ts(9)).unwrap(), 500);
    }

    #[test]
    fn test_large_amounts_do_not_overflow() {
        // original * elapsed exceeds i128 for these inputs
        let original: Amount = 10i128.pow(36);
        let start = ts(0);
        let end = ts(4_000_000_000);
        let locked = locked_amount_at(original, start, end, ts(1_000_000_000)).unwrap();
        assert_eq!(locked, original / 4 * 3);
    }

    #[tokio::test]
    async fn test_sum_locked_across_kinds() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ledger = VestingLedger::new(store.clone(), "uempe");

        ledger
            .upsert_vesting_account(&VestingAccount::Continuous(schedule("a", 1_000, 0, 100)))
            .await
            .unwrap();
        ledger
            .upsert_vesting_account(&VestingAccount::Delayed(schedule("b", 400, 0, 200)))
            .await
            .unwrap();
        ledger
            .upsert_vesting_account(&VestingAccount::Periodic {
                schedule: schedule("c", 600, 100, 300),
                periods: vec![VestingPeriod {
                    length_seconds: 200,
                    amount: vec![Coin::new("uempe", 600)],
                }],
            })
            .await
            .unwrap();

        // a: 1000 - 500 = 500, b: 400 - 100 = 300, c: before start = 600
        assert_eq!(ledger.sum_locked_at(ts(50)).await.unwrap(), 1_400);
        // a: fully vested, b: 400 - 300 = 100, c: 600 - 150 = 450
        assert_eq!(ledger.sum_locked_at(ts(150)).await.unwrap(), 550);
        assert_eq!(ledger.sum_locked_at(ts(300)).await.unwrap(), 0);

        let other = VestingLedger::new(store, "uother");
        assert_eq!(other.sum_locked_at(ts(0)).await.unwrap(), 77 * 3);
    }
}
