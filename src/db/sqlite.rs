//! SQLite implementation of every store trait
//!
//! One connection behind a mutex, WAL mode, foreign keys on. Each trait
//! method runs in its own transaction where it touches more than one row.

use super::{
    split_in_chunks, AccountDirectory, BlockIndex, MetricsStore, VestingStore, MAX_SQL_PARAMS,
};
use crate::error::{DbResultExt, StoreError};
use crate::types::{
    Account, Amount, Coin, Height, IndexedTransaction, LatestBlock, TopAccount,
    TopAccountBalance, TxEvent, VestingAccount, VestingKind, VestingPeriod, VestingSchedule,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Embedded schema, applied in order on every open (all statements are idempotent)
const MIGRATIONS: &[(&str, &str)] = &[
    ("00_blocks.sql", include_str!("../../sql/00_blocks.sql")),
    ("01_accounts.sql", include_str!("../../sql/01_accounts.sql")),
    ("02_metrics.sql", include_str!("../../sql/02_metrics.sql")),
];

/// Coin as persisted in JSON columns; the amount stays a decimal string
#[derive(Debug, Serialize, Deserialize)]
struct DbCoin {
    denom: String,
    amount: String,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Malformed {
                op: "creating database directory",
                detail: format!("{}: {}", parent.display(), e),
            })?;
        }

        let conn = Connection::open(db_path).during("opening database")?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .during("enabling WAL mode")?;
        log::debug!("SQLite journal mode: {}", journal_mode);

        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().during("opening in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)
            .during("enabling foreign keys")?;
        run_schema_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied write:
        // every multi-row write runs inside a transaction that rolls back on drop.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Apply the embedded schema files in order
pub fn run_schema_migrations(conn: &Connection) -> Result<(), StoreError> {
    for (name, sql) in MIGRATIONS {
        conn.execute_batch(sql).during("running schema migrations")?;
        log::debug!("Applied schema file {}", name);
    }
    Ok(())
}

fn parse_amount(op: &'static str, raw: &str) -> Result<Amount, StoreError> {
    raw.trim().parse::<Amount>().map_err(|e| StoreError::Malformed {
        op,
        detail: format!("amount {:?}: {}", raw, e),
    })
}

fn checked_total(
    op: &'static str,
    values: impl IntoIterator<Item = String>,
) -> Result<Amount, StoreError> {
    values.into_iter().try_fold(0 as Amount, |acc, raw| {
        let value = parse_amount(op, &raw)?;
        acc.checked_add(value).ok_or_else(|| StoreError::Malformed {
            op,
            detail: "sum overflows 128 bits".to_string(),
        })
    })
}

fn coins_to_json(coins: &[Coin]) -> Result<String, StoreError> {
    let rows: Vec<DbCoin> = coins
        .iter()
        .map(|c| DbCoin {
            denom: c.denom.clone(),
            amount: c.amount.to_string(),
        })
        .collect();
    Ok(serde_json::to_string(&rows)?)
}

fn coins_from_json(op: &'static str, json: &str) -> Result<Vec<Coin>, StoreError> {
    let rows: Vec<DbCoin> = serde_json::from_str(json)?;
    rows.into_iter()
        .map(|c| Ok(Coin::new(c.denom, parse_amount(op, &c.amount)?)))
        .collect()
}

fn to_millis(time: &DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(op: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::Malformed {
        op,
        detail: format!("timestamp {} out of range", millis),
    })
}

fn placeholders(rows: usize, per_row: usize) -> String {
    let row = format!("({})", vec!["?"; per_row].join(", "));
    vec![row; rows].join(", ")
}

/// Replace the whole period list of one vesting account
fn replace_vesting_periods(
    tx: &Transaction<'_>,
    vesting_account_id: i64,
    periods: &[VestingPeriod],
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM vesting_period WHERE vesting_account_id = ?1",
        params![vesting_account_id],
    )
    .during("deleting vesting periods")?;

    let ordered: Vec<(usize, &VestingPeriod)> = periods.iter().enumerate().collect();
    for chunk in split_in_chunks(&ordered, 4, MAX_SQL_PARAMS) {
        let sql = format!(
            "INSERT INTO vesting_period (vesting_account_id, period_order, length, amount) VALUES {}",
            placeholders(chunk.len(), 4)
        );
        let mut values = Vec::with_capacity(chunk.len() * 4);
        for (order, period) in chunk {
            values.push(Value::Integer(vesting_account_id));
            values.push(Value::Integer(*order as i64));
            values.push(Value::Integer(period.length_seconds));
            values.push(Value::Text(coins_to_json(&period.amount)?));
        }
        tx.execute(&sql, params_from_iter(values.iter()))
            .during("saving vesting periods")?;
    }

    Ok(())
}

fn load_periods(conn: &Connection, vesting_account_id: i64) -> Result<Vec<VestingPeriod>, StoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT length, amount FROM vesting_period
             WHERE vesting_account_id = ?1 ORDER BY period_order",
        )
        .during("loading vesting periods")?;
    let rows = stmt
        .query_map(params![vesting_account_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .during("loading vesting periods")?
        .collect::<Result<Vec<_>, _>>()
        .during("loading vesting periods")?;

    rows.into_iter()
        .map(|(length_seconds, amount)| {
            Ok(VestingPeriod {
                length_seconds,
                amount: coins_from_json("loading vesting periods", &amount)?,
            })
        })
        .collect()
}

#[async_trait]
impl VestingStore for SqliteStore {
    async fn upsert_vesting_account(&self, account: &VestingAccount) -> Result<(), StoreError> {
        let schedule = account.schedule();
        let original_vesting = coins_to_json(&schedule.original_vesting)?;

        let mut conn = self.lock();
        let tx = conn.transaction().during("saving vesting account")?;

        tx.execute(
            "INSERT INTO account (address) VALUES (?1) ON CONFLICT DO NOTHING",
            params![schedule.address],
        )
        .during("saving vesting account address")?;

        let id: i64 = tx
            .query_row(
                "INSERT INTO vesting_account (type, address, original_vesting, start_time, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (address) DO UPDATE SET
                    type = excluded.type,
                    original_vesting = excluded.original_vesting,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time
                 RETURNING id",
                params![
                    account.kind().as_str(),
                    schedule.address,
                    original_vesting,
                    to_millis(&schedule.start_time),
                    to_millis(&schedule.end_time),
                ],
                |row| row.get(0),
            )
            .during("saving vesting account")?;

        // Non-periodic accounts own no periods; clearing also covers a kind change
        replace_vesting_periods(&tx, id, account.periods().unwrap_or(&[]))?;

        tx.commit().during("saving vesting account")?;
        Ok(())
    }

    async fn vesting_accounts(&self) -> Result<Vec<VestingAccount>, StoreError> {
        const OP: &str = "loading vesting accounts";
        let conn = self.lock();

        let mut stmt = conn
            .prepare(
                "SELECT id, type, address, original_vesting, start_time, end_time
                 FROM vesting_account ORDER BY id",
            )
            .during(OP)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .during(OP)?
            .collect::<Result<Vec<_>, _>>()
            .during(OP)?;

        let mut accounts = Vec::with_capacity(rows.len());
        for (id, kind, address, original_vesting, start, end) in rows {
            let kind = VestingKind::from_type_name(&kind).ok_or_else(|| StoreError::Malformed {
                op: OP,
                detail: format!("unknown vesting account type {}", kind),
            })?;
            let schedule = VestingSchedule {
                address,
                original_vesting: coins_from_json(OP, &original_vesting)?,
                start_time: from_millis(OP, start)?,
                end_time: from_millis(OP, end)?,
            };
            accounts.push(match kind {
                VestingKind::Continuous => VestingAccount::Continuous(schedule),
                VestingKind::Delayed => VestingAccount::Delayed(schedule),
                VestingKind::Periodic => VestingAccount::Periodic {
                    schedule,
                    periods: load_periods(&conn, id)?,
                },
            });
        }

        Ok(accounts)
    }

    async fn vesting_periods(&self, address: &str) -> Result<Vec<VestingPeriod>, StoreError> {
        let conn = self.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM vesting_account WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()
            .during("loading vesting periods")?;

        match id {
            Some(id) => load_periods(&conn, id),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl AccountDirectory for SqliteStore {
    async fn upsert_accounts(&self, accounts: &[Account]) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction().during("storing accounts")?;

        for chunk in split_in_chunks(accounts, 1, MAX_SQL_PARAMS) {
            let sql = format!(
                "INSERT INTO account (address) VALUES {} ON CONFLICT DO NOTHING",
                placeholders(chunk.len(), 1)
            );
            tx.execute(&sql, params_from_iter(chunk.iter().map(|a| &a.address)))
                .during("storing accounts")?;
        }

        tx.commit().during("storing accounts")?;
        Ok(())
    }

    async fn upsert_top_accounts(
        &self,
        entries: &[TopAccount],
        height: Height,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction().during("storing top accounts")?;

        for chunk in split_in_chunks(entries, 3, MAX_SQL_PARAMS) {
            let sql = format!(
                "INSERT INTO top_accounts (address, type, height) VALUES {}
                 ON CONFLICT (address) DO UPDATE SET
                    type = excluded.type,
                    height = excluded.height",
                placeholders(chunk.len(), 3)
            );
            let mut values = Vec::with_capacity(chunk.len() * 3);
            for entry in chunk {
                values.push(Value::Text(entry.address.clone()));
                values.push(Value::Text(entry.type_url.clone()));
                values.push(Value::Integer(height));
            }
            tx.execute(&sql, params_from_iter(values.iter()))
                .during("storing top accounts")?;
        }

        tx.commit().during("storing top accounts")?;
        Ok(())
    }

    async fn save_top_account_balance(
        &self,
        address: &str,
        balance: &TopAccountBalance,
    ) -> Result<(), StoreError> {
        let sum = balance.sum().ok_or_else(|| StoreError::Malformed {
            op: "storing top account balance",
            detail: format!("balance sum of {} overflows 128 bits", address),
        })?;

        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE top_accounts SET
                    available = ?1, delegation = ?2, unbonding = ?3, reward = ?4, sum = ?5
                 WHERE address = ?6",
                params![
                    balance.available.to_string(),
                    balance.delegation.to_string(),
                    balance.unbonding.to_string(),
                    balance.reward.to_string(),
                    sum.to_string(),
                    address,
                ],
            )
            .during("storing top account balance")?;

        if updated == 0 {
            return Err(StoreError::NotFound("top account"));
        }
        Ok(())
    }

    async fn sum_by_type(&self, type_url: &str) -> Result<Amount, StoreError> {
        const OP: &str = "summing top accounts by type";
        let conn = self.lock();

        let mut stmt = conn
            .prepare("SELECT sum FROM top_accounts WHERE type = ?1")
            .during(OP)?;
        let sums = stmt
            .query_map(params![type_url], |row| row.get::<_, String>(0))
            .during(OP)?
            .collect::<Result<Vec<_>, _>>()
            .during(OP)?;

        checked_total(OP, sums)
    }

    async fn sum_available_for(&self, addresses: &[String]) -> Result<Amount, StoreError> {
        const OP: &str = "summing available balances";
        let conn = self.lock();

        let mut available = Vec::new();
        for chunk in split_in_chunks(addresses, 1, MAX_SQL_PARAMS) {
            let sql = format!(
                "SELECT available FROM top_accounts WHERE address IN ({})",
                vec!["?"; chunk.len()].join(", ")
            );
            let mut stmt = conn.prepare(&sql).during(OP)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))
                .during(OP)?
                .collect::<Result<Vec<_>, _>>()
                .during(OP)?;
            available.extend(rows);
        }

        checked_total(OP, available)
    }

    async fn accounts(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT address FROM account ORDER BY address")
            .during("loading accounts")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .during("loading accounts")?
            .collect::<Result<Vec<_>, _>>()
            .during("loading accounts")?;
        Ok(rows)
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn upsert_circulating_supply(
        &self,
        height: Height,
        value: Amount,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO circulating_supply (height, value) VALUES (?1, ?2)
             ON CONFLICT (height) DO UPDATE SET value = excluded.value",
            params![height, value.to_string()],
        )
        .during("storing circulating supply")?;
        Ok(())
    }

    async fn latest_circulating_supply(&self) -> Result<Amount, StoreError> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM circulating_supply ORDER BY height DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .during("getting circulating supply")?;

        match value {
            Some(raw) => parse_amount("getting circulating supply", &raw),
            None => Err(StoreError::NotFound("circulating supply")),
        }
    }

    async fn upsert_fees(
        &self,
        height: Height,
        fee_value: Amount,
        stable_fee_value: Amount,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO fees (height, fee_value, stable_fee_value) VALUES (?1, ?2, ?3)
             ON CONFLICT (height) DO UPDATE SET
                fee_value = excluded.fee_value,
                stable_fee_value = excluded.stable_fee_value",
            params![height, fee_value.to_string(), stable_fee_value.to_string()],
        )
        .during("storing fees")?;
        Ok(())
    }

    async fn latest_fees_height(&self) -> Result<Height, StoreError> {
        let conn = self.lock();
        conn.query_row("SELECT COALESCE(MAX(height), 0) FROM fees", [], |row| {
            row.get(0)
        })
        .during("fetching latest fees height")
    }

    async fn fees_at(&self, height: Height) -> Result<Option<(Amount, Amount)>, StoreError> {
        const OP: &str = "fetching fees";
        let conn = self.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT fee_value, stable_fee_value FROM fees WHERE height = ?1",
                params![height],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .during(OP)?;

        match row {
            Some((fee, stable)) => Ok(Some((parse_amount(OP, &fee)?, parse_amount(OP, &stable)?))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BlockIndex for SqliteStore {
    async fn save_block(&self, block: &LatestBlock) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO block (height, timestamp) VALUES (?1, ?2)
             ON CONFLICT (height) DO UPDATE SET timestamp = excluded.timestamp",
            params![block.height, to_millis(&block.timestamp)],
        )
        .during("storing block")?;
        Ok(())
    }

    async fn save_transaction(&self, tx: &IndexedTransaction) -> Result<(), StoreError> {
        let fee = coins_to_json(&tx.fee)?;
        let events = serde_json::to_string(&tx.events)?;

        let conn = self.lock();
        conn.execute(
            r#"INSERT INTO "transaction" (hash, height, fee, events) VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (hash) DO UPDATE SET
                  height = excluded.height,
                  fee = excluded.fee,
                  events = excluded.events"#,
            params![tx.hash, tx.height, fee, events],
        )
        .during("storing transaction")?;
        Ok(())
    }

    async fn latest_block(&self) -> Result<LatestBlock, StoreError> {
        const OP: &str = "getting latest block";
        let conn = self.lock();
        let row: Option<(Height, i64)> = conn
            .query_row(
                "SELECT height, timestamp FROM block ORDER BY height DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .during(OP)?;

        let (height, millis) = row.ok_or(StoreError::NotFound("block"))?;
        Ok(LatestBlock {
            height,
            timestamp: from_millis(OP, millis)?,
        })
    }

    async fn transactions_in_range(
        &self,
        from: Height,
        to: Height,
    ) -> Result<Vec<IndexedTransaction>, StoreError> {
        const OP: &str = "fetching transactions";
        let conn = self.lock();

        let mut stmt = conn
            .prepare(
                r#"SELECT hash, height, fee, events FROM "transaction"
                   WHERE height BETWEEN ?1 AND ?2 ORDER BY height, hash"#,
            )
            .during(OP)?;
        let rows = stmt
            .query_map(params![from, to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Height>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .during(OP)?
            .collect::<Result<Vec<_>, _>>()
            .during(OP)?;

        rows.into_iter()
            .map(|(hash, height, fee, events)| {
                Ok(IndexedTransaction {
                    hash,
                    height,
                    fee: coins_from_json(OP, &fee)?,
                    events: serde_json::from_str::<Vec<TxEvent>>(&events)?,
                })
            })
            .collect()
    }
}
