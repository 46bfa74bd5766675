//! Per-coin transactional persistence.
//!
//! One SQLite database backs the whole process. Each coin owns a namespace of
//! tables identified by its ticker prefix (`btc_deposits`, `btc_pending`, …);
//! the outbox tables are process-global. Higher layers only ever touch the
//! vocabulary exposed here — multi-row mutations go through a
//! [`sqlx::Transaction`] obtained from [`CoinStore::begin`] so they commit or
//! roll back as one atomic unit.

pub mod outbox;

use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProxyError, ProxyResult};
use crate::models::{
    AccountTotals, DepositRecord, Distinction, GlobalTotals, HandleRow, PendingPayout, UserId,
    WithdrawalRecord,
};
use crate::store::outbox::Outbox;
use crate::units::{from_unit_string, to_unit_string};

/// Process-wide storage handle.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &str) -> ProxyResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(ProxyError::Storage)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Store { pool })
    }

    /// In-memory database for tests. A single connection keeps every reader
    /// on the same memory store.
    pub async fn in_memory() -> ProxyResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Store { pool })
    }

    /// Per-coin view. The ticker becomes a table prefix, so it must be a
    /// plain lowercase identifier.
    pub fn coin(&self, ticker: &str) -> ProxyResult<CoinStore> {
        let valid = !ticker.is_empty()
            && ticker.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && ticker
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(ProxyError::Config(format!(
                "coin ticker is not a valid table prefix: {ticker}"
            )));
        }
        Ok(CoinStore {
            pool: self.pool.clone(),
            prefix: ticker.to_string(),
        })
    }

    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.pool.clone())
    }
}

/// The per-coin vocabulary over the shared database.
#[derive(Clone)]
pub struct CoinStore {
    pool: SqlitePool,
    prefix: String,
}

impl CoinStore {
    fn table(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.prefix)
    }

    pub fn coin(&self) -> &str {
        &self.prefix
    }

    /// Create this coin's tables. The distinction decides which handle
    /// column carries a uniqueness constraint.
    pub async fn migrate(&self, distinction: Distinction) -> ProxyResult<()> {
        let p = &self.prefix;
        let mut statements = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_handles (
                    user_id TEXT NOT NULL,
                    derivation_index INTEGER,
                    address TEXT,
                    tag INTEGER,
                    amount TEXT
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {p}_handles_user
                 ON {p}_handles (user_id)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_deposits (
                    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    tx_hash TEXT NOT NULL UNIQUE,
                    vout INTEGER,
                    block_hash TEXT,
                    block_height INTEGER NOT NULL,
                    block_time INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_withdrawals (
                    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    tx_hash TEXT NOT NULL UNIQUE,
                    block_hash TEXT,
                    block_height INTEGER,
                    address TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_pending (
                    user_id TEXT PRIMARY KEY,
                    amount TEXT NOT NULL,
                    address TEXT NOT NULL,
                    tag INTEGER
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_totals (
                    user_id TEXT PRIMARY KEY,
                    deposited TEXT NOT NULL,
                    withdrawn TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_global (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    deposited TEXT NOT NULL,
                    withdrawn TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_backend (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    balance TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {p}_blocks (
                    height INTEGER PRIMARY KEY,
                    block_hash TEXT
                )"
            ),
        ];
        match distinction {
            Distinction::Address | Distinction::UtxoAddress => statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {p}_handles_address
                 ON {p}_handles (address)"
            )),
            Distinction::Tag => statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {p}_handles_tag
                 ON {p}_handles (tag)"
            )),
            Distinction::Amount => statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {p}_handles_amount
                 ON {p}_handles (amount)"
            )),
        }
        for sql in statements {
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Open an atomic unit. Everything executed against the returned
    /// transaction commits together on [`Transaction::commit`] or rolls back
    /// together on drop.
    pub async fn begin(&self) -> ProxyResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ---------- handles ----------

    pub async fn lookup_handle(&self, user: &UserId) -> ProxyResult<Option<HandleRow>> {
        let sql = format!(
            "SELECT user_id, derivation_index, address, tag, amount
             FROM {} WHERE user_id = ?1",
            self.table("handles")
        );
        let row = sqlx::query(&sql)
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| handle_from_row(&r)).transpose()
    }

    pub async fn lookup_by_address(&self, address: &str) -> ProxyResult<Option<HandleRow>> {
        let sql = format!(
            "SELECT user_id, derivation_index, address, tag, amount
             FROM {} WHERE address = ?1",
            self.table("handles")
        );
        let row = sqlx::query(&sql)
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| handle_from_row(&r)).transpose()
    }

    pub async fn lookup_by_tag(&self, tag: u64) -> ProxyResult<Option<HandleRow>> {
        let sql = format!(
            "SELECT user_id, derivation_index, address, tag, amount
             FROM {} WHERE tag = ?1",
            self.table("handles")
        );
        let row = sqlx::query(&sql)
            .bind(tag as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| handle_from_row(&r)).transpose()
    }

    async fn fetch_by_amount<'e, E>(
        &self,
        executor: E,
        amount: Decimal,
    ) -> ProxyResult<Option<HandleRow>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT user_id, derivation_index, address, tag, amount
             FROM {} WHERE amount = ?1",
            self.table("handles")
        );
        let row = sqlx::query(&sql)
            .bind(to_unit_string(amount))
            .fetch_optional(executor)
            .await?;
        row.map(|r| handle_from_row(&r)).transpose()
    }

    pub async fn lookup_by_amount(&self, amount: Decimal) -> ProxyResult<Option<HandleRow>> {
        self.fetch_by_amount(&self.pool, amount).await
    }

    /// Same lookup, but observing (and observed by) the open transaction, so
    /// a reservation check is atomic with the insert that follows it.
    pub async fn lookup_by_amount_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        amount: Decimal,
    ) -> ProxyResult<Option<HandleRow>> {
        self.fetch_by_amount(&mut **tx, amount).await
    }

    pub async fn all_handles(&self) -> ProxyResult<Vec<HandleRow>> {
        let sql = format!(
            "SELECT user_id, derivation_index, address, tag, amount
             FROM {} ORDER BY rowid",
            self.table("handles")
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(handle_from_row).collect()
    }

    async fn fetch_top_column<'e, E>(&self, executor: E, column: &str) -> ProxyResult<Option<i64>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT MAX({column}) AS top FROM {}", self.table("handles"));
        let row = sqlx::query(&sql).fetch_one(executor).await?;
        Ok(row.try_get("top")?)
    }

    pub async fn top_derivation_index(&self) -> ProxyResult<Option<u32>> {
        let top = self.fetch_top_column(&self.pool, "derivation_index").await?;
        Ok(top.map(|v| v as u32))
    }

    /// Allocation read that shares the handle-insert transaction.
    pub async fn top_derivation_index_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> ProxyResult<Option<u32>> {
        let top = self.fetch_top_column(&mut **tx, "derivation_index").await?;
        Ok(top.map(|v| v as u32))
    }

    pub async fn top_tag(&self) -> ProxyResult<Option<u64>> {
        let top = self.fetch_top_column(&self.pool, "tag").await?;
        Ok(top.map(|v| v as u64))
    }

    /// Allocation read that shares the handle-insert transaction.
    pub async fn top_tag_tx(&self, tx: &mut Transaction<'_, Sqlite>) -> ProxyResult<Option<u64>> {
        let top = self.fetch_top_column(&mut **tx, "tag").await?;
        Ok(top.map(|v| v as u64))
    }

    pub async fn insert_handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        handle: &HandleRow,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, derivation_index, address, tag, amount)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            self.table("handles")
        );
        sqlx::query(&sql)
            .bind(handle.user.as_str())
            .bind(handle.derivation_index.map(|v| v as i64))
            .bind(handle.address.as_deref())
            .bind(handle.tag.map(|v| v as i64))
            .bind(handle.amount.map(to_unit_string))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Delete a user's amount-based handle. Returns whether a row went away.
    pub async fn delete_amount_handle(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user: &UserId,
    ) -> ProxyResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE user_id = ?1 AND amount IS NOT NULL",
            self.table("handles")
        );
        let result = sqlx::query(&sql)
            .bind(user.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the handle reserving an exact amount (deposit observed).
    pub async fn delete_handle_by_amount(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        amount: Decimal,
    ) -> ProxyResult<()> {
        let sql = format!("DELETE FROM {} WHERE amount = ?1", self.table("handles"));
        sqlx::query(&sql)
            .bind(to_unit_string(amount))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---------- transaction logs ----------

    pub async fn transaction_exists(&self, tx_hash: &str) -> ProxyResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE tx_hash = ?1",
            self.table("deposits")
        );
        Ok(sqlx::query(&sql)
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn withdrawal_exists(&self, tx_hash: &str) -> ProxyResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE tx_hash = ?1",
            self.table("withdrawals")
        );
        Ok(sqlx::query(&sql)
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn insert_transaction(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &DepositRecord,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, amount, tx_hash, vout, block_hash, block_height, block_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.table("deposits")
        );
        sqlx::query(&sql)
            .bind(record.user.as_str())
            .bind(to_unit_string(record.amount))
            .bind(&record.tx_hash)
            .bind(record.vout)
            .bind(record.block_hash.as_deref())
            .bind(record.block_height)
            .bind(record.block_time)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn insert_withdrawal(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &WithdrawalRecord,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, amount, tx_hash, block_hash, block_height, address, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            self.table("withdrawals")
        );
        sqlx::query(&sql)
            .bind(record.user.as_str())
            .bind(to_unit_string(record.amount))
            .bind(&record.tx_hash)
            .bind(record.block_hash.as_deref())
            .bind(record.block_height)
            .bind(&record.address)
            .bind(record.timestamp)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn list_deposits(
        &self,
        user: &UserId,
        skip: i64,
        limit: i64,
    ) -> ProxyResult<Vec<DepositRecord>> {
        let sql = format!(
            "SELECT entry_id, user_id, amount, tx_hash, vout, block_hash, block_height, block_time
             FROM {} WHERE user_id = ?1 ORDER BY entry_id DESC LIMIT ?2 OFFSET ?3",
            self.table("deposits")
        );
        let rows = sqlx::query(&sql)
            .bind(user.as_str())
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(deposit_from_row).collect()
    }

    pub async fn list_withdrawals(
        &self,
        user: &UserId,
        skip: i64,
        limit: i64,
    ) -> ProxyResult<Vec<WithdrawalRecord>> {
        let sql = format!(
            "SELECT entry_id, user_id, amount, tx_hash, block_hash, block_height, address, created_at
             FROM {} WHERE user_id = ?1 ORDER BY entry_id DESC LIMIT ?2 OFFSET ?3",
            self.table("withdrawals")
        );
        let rows = sqlx::query(&sql)
            .bind(user.as_str())
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(withdrawal_from_row).collect()
    }

    // ---------- pending payouts ----------

    async fn fetch_all_pending<'e, E>(&self, executor: E) -> ProxyResult<Vec<PendingPayout>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT user_id, amount, address, tag FROM {} ORDER BY user_id",
            self.table("pending")
        );
        let rows = sqlx::query(&sql).fetch_all(executor).await?;
        rows.iter().map(pending_from_row).collect()
    }

    pub async fn all_pending(&self) -> ProxyResult<Vec<PendingPayout>> {
        self.fetch_all_pending(&self.pool).await
    }

    async fn fetch_pending_for<'e, E>(
        &self,
        executor: E,
        user: &UserId,
    ) -> ProxyResult<Option<PendingPayout>>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT user_id, amount, address, tag FROM {} WHERE user_id = ?1",
            self.table("pending")
        );
        let row = sqlx::query(&sql)
            .bind(user.as_str())
            .fetch_optional(executor)
            .await?;
        row.map(|r| pending_from_row(&r)).transpose()
    }

    pub async fn pending_for(&self, user: &UserId) -> ProxyResult<Option<PendingPayout>> {
        self.fetch_pending_for(&self.pool, user).await
    }

    /// Admission read that shares the pending-insert transaction.
    pub async fn pending_for_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user: &UserId,
    ) -> ProxyResult<Option<PendingPayout>> {
        self.fetch_pending_for(&mut **tx, user).await
    }

    /// Aggregate amount of every active pending payout, in minimal units.
    pub async fn pending_sum(&self) -> ProxyResult<Decimal> {
        let pending = self.all_pending().await?;
        Ok(pending.iter().map(|p| p.amount).sum())
    }

    /// Admission read that shares the pending-insert transaction.
    pub async fn pending_sum_tx(&self, tx: &mut Transaction<'_, Sqlite>) -> ProxyResult<Decimal> {
        let pending = self.fetch_all_pending(&mut **tx).await?;
        Ok(pending.iter().map(|p| p.amount).sum())
    }

    pub async fn insert_pending(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        payout: &PendingPayout,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, amount, address, tag) VALUES (?1, ?2, ?3, ?4)",
            self.table("pending")
        );
        sqlx::query(&sql)
            .bind(payout.user.as_str())
            .bind(to_unit_string(payout.amount))
            .bind(&payout.address)
            .bind(payout.tag.map(|v| v as i64))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn delete_pending(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user: &UserId,
    ) -> ProxyResult<()> {
        let sql = format!("DELETE FROM {} WHERE user_id = ?1", self.table("pending"));
        sqlx::query(&sql)
            .bind(user.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---------- totals ----------

    pub async fn account_totals(&self, user: &UserId) -> ProxyResult<AccountTotals> {
        let sql = format!(
            "SELECT deposited, withdrawn FROM {} WHERE user_id = ?1",
            self.table("totals")
        );
        let row = sqlx::query(&sql)
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(AccountTotals {
                deposited: from_unit_string(&r.try_get::<String, _>("deposited")?)?,
                withdrawn: from_unit_string(&r.try_get::<String, _>("withdrawn")?)?,
            }),
            None => Ok(AccountTotals::default()),
        }
    }

    pub async fn global_totals(&self) -> ProxyResult<GlobalTotals> {
        let sql = format!(
            "SELECT deposited, withdrawn FROM {} WHERE id = 1",
            self.table("global")
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        match row {
            Some(r) => Ok(GlobalTotals {
                deposited: from_unit_string(&r.try_get::<String, _>("deposited")?)?,
                withdrawn: from_unit_string(&r.try_get::<String, _>("withdrawn")?)?,
            }),
            None => Ok(GlobalTotals::default()),
        }
    }

    /// Credit `deposit_delta` / `withdrawal_delta` onto a user's cumulative
    /// totals, creating the row on first touch. Read-modify-write is safe
    /// here: the enclosing transaction serialises access.
    pub async fn update_account_totals(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user: &UserId,
        deposit_delta: Decimal,
        withdrawal_delta: Decimal,
    ) -> ProxyResult<()> {
        let select = format!(
            "SELECT deposited, withdrawn FROM {} WHERE user_id = ?1",
            self.table("totals")
        );
        let current = sqlx::query(&select)
            .bind(user.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        let (deposited, withdrawn) = match current {
            Some(r) => (
                from_unit_string(&r.try_get::<String, _>("deposited")?)?,
                from_unit_string(&r.try_get::<String, _>("withdrawn")?)?,
            ),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        let upsert = format!(
            "INSERT INTO {} (user_id, deposited, withdrawn) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                deposited = excluded.deposited,
                withdrawn = excluded.withdrawn",
            self.table("totals")
        );
        sqlx::query(&upsert)
            .bind(user.as_str())
            .bind(to_unit_string(deposited + deposit_delta))
            .bind(to_unit_string(withdrawn + withdrawal_delta))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn update_global_totals(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        deposit_delta: Decimal,
        withdrawal_delta: Decimal,
    ) -> ProxyResult<()> {
        let select = format!(
            "SELECT deposited, withdrawn FROM {} WHERE id = 1",
            self.table("global")
        );
        let current = sqlx::query(&select).fetch_optional(&mut **tx).await?;
        let (deposited, withdrawn) = match current {
            Some(r) => (
                from_unit_string(&r.try_get::<String, _>("deposited")?)?,
                from_unit_string(&r.try_get::<String, _>("withdrawn")?)?,
            ),
            None => (Decimal::ZERO, Decimal::ZERO),
        };
        let upsert = format!(
            "INSERT INTO {} (id, deposited, withdrawn) VALUES (1, ?1, ?2)
             ON CONFLICT (id) DO UPDATE SET
                deposited = excluded.deposited,
                withdrawn = excluded.withdrawn",
            self.table("global")
        );
        sqlx::query(&upsert)
            .bind(to_unit_string(deposited + deposit_delta))
            .bind(to_unit_string(withdrawn + withdrawal_delta))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---------- backend balance ----------

    async fn fetch_backend_balance<'e, E>(&self, executor: E) -> ProxyResult<Decimal>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!("SELECT balance FROM {} WHERE id = 1", self.table("backend"));
        let row = sqlx::query(&sql).fetch_optional(executor).await?;
        match row {
            Some(r) => from_unit_string(&r.try_get::<String, _>("balance")?),
            None => Ok(Decimal::ZERO),
        }
    }

    pub async fn backend_balance(&self) -> ProxyResult<Decimal> {
        self.fetch_backend_balance(&self.pool).await
    }

    /// Admission read that shares the pending-insert transaction.
    pub async fn backend_balance_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> ProxyResult<Decimal> {
        self.fetch_backend_balance(&mut **tx).await
    }

    pub async fn update_backend_balance(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        balance: Decimal,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, balance) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET balance = excluded.balance",
            self.table("backend")
        );
        sqlx::query(&sql)
            .bind(to_unit_string(balance))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---------- processed-block watermark ----------

    pub async fn block_processed_height(&self, height: i64) -> ProxyResult<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE height = ?1", self.table("blocks"));
        Ok(sqlx::query(&sql)
            .bind(height)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn block_processed_hash(&self, block_hash: &str) -> ProxyResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE block_hash = ?1",
            self.table("blocks")
        );
        Ok(sqlx::query(&sql)
            .bind(block_hash)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    /// Highest reconciled block height, if any.
    pub async fn watermark(&self) -> ProxyResult<Option<i64>> {
        let sql = format!("SELECT MAX(height) AS top FROM {}", self.table("blocks"));
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("top")?)
    }

    pub async fn record_processed_block(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        height: i64,
        block_hash: Option<&str>,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (height, block_hash) VALUES (?1, ?2)",
            self.table("blocks")
        );
        sqlx::query(&sql)
            .bind(height)
            .bind(block_hash)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn handle_from_row(row: &SqliteRow) -> ProxyResult<HandleRow> {
    let amount = row
        .try_get::<Option<String>, _>("amount")?
        .map(|s| from_unit_string(&s))
        .transpose()?;
    Ok(HandleRow {
        user: UserId::from_stored(row.try_get("user_id")?),
        derivation_index: row
            .try_get::<Option<i64>, _>("derivation_index")?
            .map(|v| v as u32),
        address: row.try_get("address")?,
        tag: row.try_get::<Option<i64>, _>("tag")?.map(|v| v as u64),
        amount,
    })
}

fn deposit_from_row(row: &SqliteRow) -> ProxyResult<DepositRecord> {
    Ok(DepositRecord {
        entry_id: row.try_get("entry_id")?,
        user: UserId::from_stored(row.try_get("user_id")?),
        amount: from_unit_string(&row.try_get::<String, _>("amount")?)?,
        tx_hash: row.try_get("tx_hash")?,
        vout: row.try_get("vout")?,
        block_hash: row.try_get("block_hash")?,
        block_height: row.try_get("block_height")?,
        block_time: row.try_get("block_time")?,
    })
}

fn withdrawal_from_row(row: &SqliteRow) -> ProxyResult<WithdrawalRecord> {
    Ok(WithdrawalRecord {
        entry_id: row.try_get("entry_id")?,
        user: UserId::from_stored(row.try_get("user_id")?),
        amount: from_unit_string(&row.try_get::<String, _>("amount")?)?,
        tx_hash: row.try_get("tx_hash")?,
        block_hash: row.try_get("block_hash")?,
        block_height: row.try_get("block_height")?,
        address: row.try_get("address")?,
        timestamp: row.try_get("created_at")?,
    })
}

fn pending_from_row(row: &SqliteRow) -> ProxyResult<PendingPayout> {
    Ok(PendingPayout {
        user: UserId::from_stored(row.try_get("user_id")?),
        amount: from_unit_string(&row.try_get::<String, _>("amount")?)?,
        address: row.try_get("address")?,
        tag: row.try_get::<Option<i64>, _>("tag")?.map(|v| v as u64),
    })
}
