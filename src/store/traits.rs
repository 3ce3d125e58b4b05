//! Persistence seams for transactions and dead letters.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{DeadLetter, DeadLetterReason, ParsedTransaction};

/// Transaction persistence. One row per `message_id`; the upsert is a full
/// replace, so re-writing a transaction is always safe.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert or fully replace the row for `txn.message_id` atomically.
    async fn upsert_transaction(&self, txn: &ParsedTransaction) -> Result<(), StoreError>;

    /// Fetch one transaction by message ID.
    async fn get_transaction(
        &self,
        message_id: &str,
    ) -> Result<Option<ParsedTransaction>, StoreError>;

    /// Total stored transactions.
    async fn count_transactions(&self) -> Result<u64, StoreError>;
}

/// Dead-letter holding area. Append-only except for inspector deletes.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append_dead_letter(&self, letter: &DeadLetter) -> Result<(), StoreError>;

    /// All parked letters, newest first. `reason` narrows the listing.
    async fn list_dead_letters(
        &self,
        reason: Option<DeadLetterReason>,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// Fetch one letter by ID; `StoreError::NotFound` when absent.
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetter, StoreError>;

    /// Remove a letter after a successful replay.
    async fn delete_dead_letter(&self, id: Uuid) -> Result<(), StoreError>;
}
