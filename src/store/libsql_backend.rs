//! libSQL backend implementing the transaction and dead-letter stores.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text, decimals as their exact string rendering.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{DeadLetter, DeadLetterReason, ParsedTransaction, TransactionType};
use crate::store::migrations;
use crate::store::traits::{DeadLetterStore, TransactionStore};

/// libSQL store backend.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_db_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn decimal_to_db(value: &Option<Decimal>) -> Option<String> {
    value.map(|d| d.to_string())
}

fn decimal_from_db(value: Option<String>) -> Option<Decimal> {
    value.and_then(|s| Decimal::from_str(&s).ok())
}

/// Map a libsql Row to a ParsedTransaction.
///
/// Column order matches TXN_COLUMNS:
/// 0:message_id, 1:device_id, 2:sender, 3:occurred_at, 4:raw_body,
/// 5:transaction_type, 6:amount, 7:currency, 8:card_last4, 9:merchant,
/// 10:city, 11:address, 12:balance_after, 13:parser_version
fn row_to_transaction(row: &libsql::Row) -> Result<ParsedTransaction, libsql::Error> {
    let type_str: String = row.get(5)?;
    Ok(ParsedTransaction {
        message_id: row.get(0)?,
        device_id: row.get::<Option<String>>(1)?,
        sender: row.get(2)?,
        occurred_at: parse_db_datetime(&row.get::<String>(3)?),
        raw_body: row.get(4)?,
        transaction_type: TransactionType::from_str_loose(&type_str)
            .unwrap_or(TransactionType::Unknown),
        amount: decimal_from_db(row.get::<Option<String>>(6)?),
        currency: row.get::<Option<String>>(7)?,
        card_last4: row.get::<Option<String>>(8)?,
        merchant: row.get::<Option<String>>(9)?,
        city: row.get::<Option<String>>(10)?,
        address: row.get::<Option<String>>(11)?,
        balance_after: decimal_from_db(row.get::<Option<String>>(12)?),
        parser_version: row.get(13)?,
    })
}

const TXN_COLUMNS: &str = "message_id, device_id, sender, occurred_at, raw_body, \
     transaction_type, amount, currency, card_last4, merchant, city, address, \
     balance_after, parser_version";

fn row_to_dead_letter(row: &libsql::Row) -> Result<DeadLetter, libsql::Error> {
    let id_str: String = row.get(0)?;
    let reason_str: String = row.get(1)?;
    Ok(DeadLetter {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        reason: DeadLetterReason::parse(&reason_str)
            .unwrap_or(DeadLetterReason::ValidationFailed),
        original_payload: row.get(2)?,
        error_detail: row.get(3)?,
        timestamp: parse_db_datetime(&row.get::<String>(4)?),
    })
}

// ── TransactionStore ────────────────────────────────────────────────

#[async_trait]
impl TransactionStore for LibSqlStore {
    async fn upsert_transaction(&self, txn: &ParsedTransaction) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO transactions (
                    message_id, device_id, sender, occurred_at, raw_body,
                    transaction_type, amount, currency, card_last4, merchant,
                    city, address, balance_after, parser_version, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                ON CONFLICT(message_id) DO UPDATE SET
                    device_id = excluded.device_id,
                    sender = excluded.sender,
                    occurred_at = excluded.occurred_at,
                    raw_body = excluded.raw_body,
                    transaction_type = excluded.transaction_type,
                    amount = excluded.amount,
                    currency = excluded.currency,
                    card_last4 = excluded.card_last4,
                    merchant = excluded.merchant,
                    city = excluded.city,
                    address = excluded.address,
                    balance_after = excluded.balance_after,
                    parser_version = excluded.parser_version,
                    updated_at = excluded.updated_at",
                params![
                    txn.message_id.as_str(),
                    txn.device_id.clone(),
                    txn.sender.as_str(),
                    txn.occurred_at.to_rfc3339(),
                    txn.raw_body.as_str(),
                    txn.transaction_type.as_str(),
                    decimal_to_db(&txn.amount),
                    txn.currency.clone(),
                    txn.card_last4.clone(),
                    txn.merchant.clone(),
                    txn.city.clone(),
                    txn.address.clone(),
                    decimal_to_db(&txn.balance_after),
                    txn.parser_version.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert transaction: {e}")))?;
        Ok(())
    }

    async fn get_transaction(
        &self,
        message_id: &str,
    ) -> Result<Option<ParsedTransaction>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get transaction: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get transaction: {e}")))?
        {
            Some(row) => Ok(Some(row_to_transaction(&row).map_err(|e| {
                StoreError::Query(format!("map transaction row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn count_transactions(&self) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM transactions", ())
            .await
            .map_err(|e| StoreError::Query(format!("count transactions: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("count transactions: {e}")))?
            .ok_or_else(|| StoreError::Query("count returned no rows".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("count transactions: {e}")))?;
        Ok(count as u64)
    }
}

// ── DeadLetterStore ─────────────────────────────────────────────────

#[async_trait]
impl DeadLetterStore for LibSqlStore {
    async fn append_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO dead_letters (id, reason, original_payload, error_detail, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    letter.id.to_string(),
                    letter.reason.as_str(),
                    letter.original_payload.as_str(),
                    letter.error_detail.as_str(),
                    letter.timestamp.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append dead letter: {e}")))?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        reason: Option<DeadLetterReason>,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut rows = match reason {
            Some(reason) => self
                .conn()
                .query(
                    "SELECT id, reason, original_payload, error_detail, timestamp
                     FROM dead_letters WHERE reason = ?1 ORDER BY timestamp DESC",
                    params![reason.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(
                    "SELECT id, reason, original_payload, error_detail, timestamp
                     FROM dead_letters ORDER BY timestamp DESC",
                    (),
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("list dead letters: {e}")))?;

        let mut letters = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list dead letters: {e}")))?
        {
            letters.push(
                row_to_dead_letter(&row)
                    .map_err(|e| StoreError::Query(format!("map dead letter row: {e}")))?,
            );
        }
        Ok(letters)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, reason, original_payload, error_detail, timestamp
                 FROM dead_letters WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get dead letter: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get dead letter: {e}")))?
        {
            Some(row) => row_to_dead_letter(&row)
                .map_err(|e| StoreError::Query(format!("map dead letter row: {e}"))),
            None => Err(StoreError::NotFound {
                entity: "dead_letter".into(),
                id: id.to_string(),
            }),
        }
    }

    async fn delete_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM dead_letters WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete dead letter: {e}")))?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "dead_letter".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
