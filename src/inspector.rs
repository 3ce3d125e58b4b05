//! Dead-Letter Inspector — operator-facing list and replay.
//!
//! Replay re-runs the parked payload through the live pipeline code, so a
//! fixed parser or recovered store is exercised exactly as production would.
//! A letter is deleted only when its replay reaches a terminal success
//! (published or written); failed replays leave the letter untouched and
//! never append a duplicate.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::model::{DeadLetter, DeadLetterReason, ParsedTransaction, RawMessage};
use crate::pipeline::worker::{Outcome, ParserWorker};
use crate::store::DeadLetterStore;
use crate::writer::{IdempotentWriter, WriteOutcome};

/// Result of replaying one dead letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Raw payload made it through the worker; letter deleted.
    Published,
    /// Parsed payload made it into the store; letter deleted.
    Written,
    /// Pipeline classified the payload as non-transactional; letter kept for
    /// the operator to delete explicitly.
    Skipped,
    /// Replay failed again; letter kept, no duplicate appended.
    Rejected {
        reason: DeadLetterReason,
        detail: String,
    },
}

/// Operator tool over the dead-letter holding area.
pub struct DeadLetterInspector {
    store: Arc<dyn DeadLetterStore>,
    worker: Arc<ParserWorker>,
    writer: Arc<IdempotentWriter>,
}

impl DeadLetterInspector {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        worker: Arc<ParserWorker>,
        writer: Arc<IdempotentWriter>,
    ) -> Self {
        Self {
            store,
            worker,
            writer,
        }
    }

    /// All parked letters, optionally narrowed to one reason.
    pub async fn list(&self, reason: Option<DeadLetterReason>) -> Result<Vec<DeadLetter>, Error> {
        Ok(self.store.list_dead_letters(reason).await?)
    }

    /// Remove a letter without replaying it.
    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        self.store.delete_dead_letter(id).await?;
        info!(%id, "Dead letter deleted");
        Ok(())
    }

    /// Re-run a parked payload through the pipeline.
    ///
    /// Worker-stage letters hold a raw message; writer-stage letters hold a
    /// parsed transaction. The payload shape decides the path — the two
    /// schemas share no parseable overlap.
    pub async fn replay(&self, id: Uuid) -> Result<ReplayOutcome, Error> {
        let letter = self.store.get_dead_letter(id).await?;
        let payload = letter.original_payload.as_bytes();

        if serde_json::from_slice::<RawMessage>(payload).is_ok() {
            return self.replay_raw(&letter).await;
        }
        if serde_json::from_slice::<ParsedTransaction>(payload).is_ok() {
            return self.replay_parsed(&letter).await;
        }

        Ok(ReplayOutcome::Rejected {
            reason: letter.reason,
            detail: "payload is neither a raw message nor a parsed transaction".into(),
        })
    }

    async fn replay_raw(&self, letter: &DeadLetter) -> Result<ReplayOutcome, Error> {
        let outcome = self
            .worker
            .process_payload(letter.original_payload.as_bytes())
            .await?;
        match outcome {
            Outcome::Published => {
                self.store.delete_dead_letter(letter.id).await?;
                info!(id = %letter.id, "Dead letter replayed and published");
                Ok(ReplayOutcome::Published)
            }
            Outcome::Skipped => Ok(ReplayOutcome::Skipped),
            Outcome::Rejected { reason, detail } => Ok(ReplayOutcome::Rejected { reason, detail }),
        }
    }

    async fn replay_parsed(&self, letter: &DeadLetter) -> Result<ReplayOutcome, Error> {
        let outcome = self
            .writer
            .process_payload(letter.original_payload.as_bytes())
            .await?;
        match outcome {
            WriteOutcome::Written => {
                self.store.delete_dead_letter(letter.id).await?;
                info!(id = %letter.id, "Dead letter replayed and written");
                Ok(ReplayOutcome::Written)
            }
            WriteOutcome::Rejected { reason, detail } => {
                Ok(ReplayOutcome::Rejected { reason, detail })
            }
        }
    }
}

/// Convenience for callers that want NotFound as a distinct exit code.
pub fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Store(StoreError::NotFound { .. }))
}
