//! Process-global pull-once event queues.
//!
//! Three tables shared across coins: processed deposits, processed
//! withdrawals, rejected withdrawals. A drain returns the matching rows and
//! deletes them in the same transaction — a caller that fails to persist what
//! it read loses those records, which keeps the outbox bounded.

use serde_json::Value;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::{ProxyError, ProxyResult};
use crate::models::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    ProcessedDeposits,
    ProcessedWithdrawals,
    RejectedWithdrawals,
}

impl OutboxKind {
    fn table(&self) -> &'static str {
        match self {
            OutboxKind::ProcessedDeposits => "outbox_deposits",
            OutboxKind::ProcessedWithdrawals => "outbox_withdrawals",
            OutboxKind::RejectedWithdrawals => "outbox_rejections",
        }
    }

    fn all() -> [OutboxKind; 3] {
        [
            OutboxKind::ProcessedDeposits,
            OutboxKind::ProcessedWithdrawals,
            OutboxKind::RejectedWithdrawals,
        ]
    }
}

/// An event waiting in (or headed for) the outbox.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub coin: String,
    pub user: UserId,
    pub payload: Value,
}

#[derive(Clone)]
pub struct Outbox {
    pool: SqlitePool,
}

impl Outbox {
    pub fn new(pool: SqlitePool) -> Self {
        Outbox { pool }
    }

    pub async fn migrate(&self) -> ProxyResult<()> {
        for kind in OutboxKind::all() {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    coin TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    payload TEXT NOT NULL
                )",
                kind.table()
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> ProxyResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn push(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        kind: OutboxKind,
        event: &OutboxEvent,
    ) -> ProxyResult<()> {
        let sql = format!(
            "INSERT INTO {} (coin, user_id, payload) VALUES (?1, ?2, ?3)",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(&event.coin)
            .bind(event.user.as_str())
            .bind(event.payload.to_string())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Return and delete every entry for `(coin, user)` — exactly once.
    pub async fn drain(
        &self,
        kind: OutboxKind,
        coin: &str,
        user: &UserId,
    ) -> ProxyResult<Vec<Value>> {
        let mut tx = self.pool.begin().await?;
        let select = format!(
            "SELECT entry_id, payload FROM {} WHERE coin = ?1 AND user_id = ?2
             ORDER BY entry_id",
            kind.table()
        );
        let rows = sqlx::query(&select)
            .bind(coin)
            .bind(user.as_str())
            .fetch_all(&mut *tx)
            .await?;
        let payloads = parse_payloads(&rows)?;
        if let Some(last) = rows.last() {
            let last_id: i64 = last.try_get("entry_id")?;
            let delete = format!(
                "DELETE FROM {} WHERE coin = ?1 AND user_id = ?2 AND entry_id <= ?3",
                kind.table()
            );
            sqlx::query(&delete)
                .bind(coin)
                .bind(user.as_str())
                .bind(last_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(payloads)
    }

    /// Drain every entry for a coin regardless of user.
    pub async fn drain_all(&self, kind: OutboxKind, coin: &str) -> ProxyResult<Vec<Value>> {
        let mut tx = self.pool.begin().await?;
        let select = format!(
            "SELECT entry_id, payload FROM {} WHERE coin = ?1 ORDER BY entry_id",
            kind.table()
        );
        let rows = sqlx::query(&select).bind(coin).fetch_all(&mut *tx).await?;
        let payloads = parse_payloads(&rows)?;
        if let Some(last) = rows.last() {
            let last_id: i64 = last.try_get("entry_id")?;
            let delete = format!(
                "DELETE FROM {} WHERE coin = ?1 AND entry_id <= ?2",
                kind.table()
            );
            sqlx::query(&delete)
                .bind(coin)
                .bind(last_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(payloads)
    }
}

fn parse_payloads(rows: &[sqlx::sqlite::SqliteRow]) -> ProxyResult<Vec<Value>> {
    rows.iter()
        .map(|r| {
            let raw: String = r.try_get("payload")?;
            serde_json::from_str(&raw)
                .map_err(|e| ProxyError::MalformedResponse(format!("bad outbox payload: {e}")))
        })
        .collect()
}
