//! Idempotent writer — the sole mutator of the transactions table.
//!
//! Consumes the parsed subject and upserts each transaction keyed by
//! `message_id`. Because the upsert is a full replace, duplicates from
//! redelivery or replays converge on one row. Transient store failures are
//! retried with exponential backoff; exhaustion parks the payload as a dead
//! letter instead of blocking the subject.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::{MessageBus, SUBJECT_FAILED, SUBJECT_PARSED};
use crate::error::{Error, StoreError};
use crate::metrics::PipelineMetrics;
use crate::model::{DeadLetter, DeadLetterReason, ParsedTransaction};
use crate::pipeline::validate::validate_transaction;
use crate::store::{DeadLetterStore, TransactionStore};

/// Backoff policy for store writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based): capped exponential growth
    /// plus up to 10% jitter so competing writers do not retry in lockstep.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(31));
        let capped = exp.min(self.max_delay);
        let jitter_cap = capped.as_millis() as u64 / 10;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Terminal result of handling one parsed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Row upserted.
    Written,
    /// Permanent failure; caller records the dead letter.
    Rejected {
        reason: DeadLetterReason,
        detail: String,
    },
}

/// Consumer of the parsed subject; owns all transaction-table writes.
pub struct IdempotentWriter {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn TransactionStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<PipelineMetrics>,
    retry: RetryPolicy,
}

impl IdempotentWriter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn TransactionStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<PipelineMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            store,
            dead_letters,
            metrics,
            retry,
        }
    }

    /// Validate and upsert one parsed payload.
    ///
    /// The parsed subject is an open boundary, so schema invariants are
    /// re-checked here even though the worker already ran them.
    pub async fn process_payload(&self, payload: &[u8]) -> Result<WriteOutcome, Error> {
        let txn: ParsedTransaction = match serde_json::from_slice(payload) {
            Ok(txn) => txn,
            Err(e) => {
                return Ok(WriteOutcome::Rejected {
                    reason: DeadLetterReason::ValidationFailed,
                    detail: format!("malformed parsed payload: {e}"),
                });
            }
        };

        if let Err(failure) = validate_transaction(&txn, chrono::Utc::now()) {
            return Ok(WriteOutcome::Rejected {
                reason: failure.reason,
                detail: failure.detail,
            });
        }

        match self.write_with_retry(&txn).await {
            Ok(()) => {
                self.metrics.record_written();
                info!(message_id = %txn.message_id, "Transaction written");
                Ok(WriteOutcome::Written)
            }
            Err(e @ StoreError::RetriesExhausted { .. }) => {
                // Exhaustion is an operator-attention event: the payload is
                // parked, nothing is lost, but writes are failing.
                error!(
                    alert = true,
                    message_id = %txn.message_id,
                    error = %e,
                    "Store write retries exhausted, parking payload"
                );
                Ok(WriteOutcome::Rejected {
                    reason: DeadLetterReason::StoreWriteExhausted,
                    detail: e.to_string(),
                })
            }
            Err(e) => Err(Error::Store(e)),
        }
    }

    async fn write_with_retry(&self, txn: &ParsedTransaction) -> Result<(), StoreError> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match self.store.upsert_transaction(txn).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.max_attempts => {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        message_id = %txn.message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Record a permanent failure durably, plus a copy on the failed subject.
    pub async fn dead_letter(
        &self,
        reason: DeadLetterReason,
        payload: &[u8],
        detail: &str,
    ) -> Result<(), Error> {
        let letter = DeadLetter::new(reason, &String::from_utf8_lossy(payload), detail);
        self.dead_letters.append_dead_letter(&letter).await?;
        self.metrics.record_dead_letter(reason);
        warn!(
            id = %letter.id,
            reason = reason.as_str(),
            detail,
            "Parsed payload dead-lettered"
        );

        if let Ok(copy) = serde_json::to_vec(&letter)
            && let Err(e) = self.bus.publish(SUBJECT_FAILED, &copy).await
        {
            warn!(error = %e, "Failed to publish dead-letter copy");
        }
        Ok(())
    }

    /// Consume the parsed subject until shutdown. Writes are sequential:
    /// the store is the bottleneck and ordering keeps upserts predictable.
    pub async fn run(
        self: Arc<Self>,
        consumer_group: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let mut sub = self.bus.subscribe(SUBJECT_PARSED, consumer_group).await?;
        info!(group = consumer_group, "Writer started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = sub.next() => {
                    let Some(delivery) = maybe else { break };
                    match self.process_payload(delivery.payload()).await {
                        Ok(WriteOutcome::Rejected { reason, detail }) => {
                            match self.dead_letter(reason, delivery.payload(), &detail).await {
                                Ok(()) => delivery.ack(),
                                Err(e) => error!(error = %e, "Dead-letter write failed"),
                            }
                        }
                        Ok(WriteOutcome::Written) => delivery.ack(),
                        Err(e) => {
                            warn!(error = %e, "Transient write failure, payload will be redelivered");
                        }
                    }
                }
            }
        }

        info!(group = consumer_group, "Writer stopped");
        Ok(())
    }
}
