//! Parser worker — drives raw messages through classify/extract/validate.
//!
//! State machine per message:
//! received → classified → {skipped | extracted} → validated → {published |
//! dead-lettered}. The bus ack is the sole commit point: a delivery is acked
//! only once its terminal effect (publish or durable dead letter) has
//! happened, so a crash at any earlier point redelivers the message.
//!
//! Failures split two ways:
//! - retryable (oracle transport, downstream publish): the delivery is
//!   dropped unacked and comes back
//! - permanent (malformed payload, validation, no-match): dead-lettered and
//!   acked, since redelivery cannot change the outcome

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, SUBJECT_FAILED, SUBJECT_PARSED, SUBJECT_PROCESSING, SUBJECT_RAW};
use crate::classify::Classifier;
use crate::error::{Error, ExtractionError, PipelineError};
use crate::extract::ExtractionAdapter;
use crate::metrics::PipelineMetrics;
use crate::model::{Classification, DeadLetter, DeadLetterReason, RawMessage};
use crate::pipeline::validate::validate_transaction;
use crate::store::DeadLetterStore;

/// Terminal result of processing one raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Classified as non-transactional; no oracle call, nothing published.
    Skipped,
    /// Normalized transaction published to the parsed subject.
    Published,
    /// Permanent failure; the caller decides whether to record a dead letter.
    Rejected {
        reason: DeadLetterReason,
        detail: String,
    },
}

/// Progress note published on the processing subject as a message enters
/// extraction, so operators can watch throughput without log access.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessingNote {
    pub message_id: String,
    pub stage: String,
}

/// The pipeline worker. Consumes raw messages, publishes parsed ones.
pub struct ParserWorker {
    bus: Arc<dyn MessageBus>,
    adapter: Arc<ExtractionAdapter>,
    classifier: Classifier,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<PipelineMetrics>,
}

impl ParserWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        adapter: Arc<ExtractionAdapter>,
        classifier: Classifier,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            bus,
            adapter,
            classifier,
            dead_letters,
            metrics,
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Run one raw payload through classify → extract → validate → publish.
    ///
    /// `Err` means retryable: nothing terminal happened and the payload is
    /// safe to process again. `Ok(Rejected { .. })` is permanent and has NOT
    /// been dead-lettered yet — the run loop records it, replays do not.
    pub async fn process_payload(&self, payload: &[u8]) -> Result<Outcome, Error> {
        let message: RawMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                return Ok(Outcome::Rejected {
                    reason: DeadLetterReason::ValidationFailed,
                    detail: format!("malformed raw payload: {e}"),
                });
            }
        };
        self.metrics.record_received();

        if self.classifier.classify(&message) == Classification::OneTimeCode {
            debug!(message_id = %message.message_id, "Skipped non-transactional message");
            self.metrics.record_skipped();
            return Ok(Outcome::Skipped);
        }

        self.publish_note(&message.message_id, "extracting").await;

        let txn = match self.adapter.extract(&message).await {
            Ok(txn) => txn,
            Err(e) if e.retryable() => {
                return Err(Error::Extraction(e));
            }
            Err(e) => {
                let reason = match e {
                    ExtractionError::NoMatch => DeadLetterReason::Unmatched,
                    ExtractionError::InvalidResponse(_) => DeadLetterReason::ExtractionFailed,
                    _ => DeadLetterReason::ValidationFailed,
                };
                return Ok(Outcome::Rejected {
                    reason,
                    detail: e.to_string(),
                });
            }
        };

        if let Err(failure) = validate_transaction(&txn, chrono::Utc::now()) {
            return Ok(Outcome::Rejected {
                reason: failure.reason,
                detail: failure.detail,
            });
        }

        let parsed = serde_json::to_vec(&txn)
            .map_err(|e| Error::Pipeline(PipelineError::Publish(e.to_string())))?;
        self.bus
            .publish(SUBJECT_PARSED, &parsed)
            .await
            .map_err(|e| Error::Pipeline(PipelineError::Publish(e.to_string())))?;

        self.metrics.record_published();
        info!(
            message_id = %txn.message_id,
            transaction_type = txn.transaction_type.as_str(),
            "Published parsed transaction"
        );
        Ok(Outcome::Published)
    }

    /// Record a permanent failure: durable store row first, then a
    /// best-effort copy on the failed subject.
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
            "Message dead-lettered"
        );

        match serde_json::to_vec(&letter) {
            Ok(copy) => {
                if let Err(e) = self.bus.publish(SUBJECT_FAILED, &copy).await {
                    warn!(error = %e, "Failed to publish dead-letter copy");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize dead-letter copy"),
        }
        Ok(())
    }

    async fn publish_note(&self, message_id: &str, stage: &str) {
        let note = ProcessingNote {
            message_id: message_id.to_string(),
            stage: stage.to_string(),
        };
        if let Ok(bytes) = serde_json::to_vec(&note)
            && let Err(e) = self.bus.publish(SUBJECT_PROCESSING, &bytes).await
        {
            debug!(error = %e, "Failed to publish processing note");
        }
    }

    /// Consume the raw subject until shutdown, with bounded concurrency.
    ///
    /// In-flight messages are drained before returning; unacked deliveries
    /// from a hard kill are redelivered by the bus.
    pub async fn run(
        self: Arc<Self>,
        consumer_group: &str,
        max_in_flight: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let mut sub = self.bus.subscribe(SUBJECT_RAW, consumer_group).await?;
        let semaphore = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        info!(group = consumer_group, max_in_flight, "Parser worker started");

        loop {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = sub.next() => {
                    let Some(delivery) = maybe else { break };
                    let worker = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        match worker.process_payload(delivery.payload()).await {
                            Ok(Outcome::Rejected { reason, detail }) => {
                                match worker.dead_letter(reason, delivery.payload(), &detail).await {
                                    Ok(()) => delivery.ack(),
                                    // Store down: leave unacked for redelivery.
                                    Err(e) => error!(error = %e, "Dead-letter write failed"),
                                }
                            }
                            Ok(_) => delivery.ack(),
                            Err(e) => {
                                warn!(error = %e, "Transient failure, message will be redelivered");
                            }
                        }
                    });
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        info!(group = consumer_group, "Parser worker drained and stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::extract::Oracle;
    use crate::model::ParsedTransaction;
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct FixedOracle(String);

    #[async_trait]
    impl Oracle for FixedOracle {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn extract(&self, _body: &str) -> Result<String, ExtractionError> {
            Ok(self.0.clone())
        }
    }

    struct DownOracle;

    #[async_trait]
    impl Oracle for DownOracle {
        fn model_name(&self) -> &str {
            "mock-down"
        }

        async fn extract(&self, _body: &str) -> Result<String, ExtractionError> {
            Err(ExtractionError::Oracle("503".into()))
        }
    }

    async fn make_worker(oracle: Arc<dyn Oracle>) -> (Arc<ParserWorker>, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let worker = Arc::new(ParserWorker::new(
            bus.clone(),
            Arc::new(ExtractionAdapter::new(oracle)),
            Classifier::default_markers(),
            store,
            Arc::new(PipelineMetrics::new()),
        ));
        (worker, bus)
    }

    fn raw_payload(body: &str) -> Vec<u8> {
        serde_json::to_vec(&RawMessage::new("BANK", body, Utc::now())).unwrap()
    }

    fn good_answer() -> String {
        r#"{"transaction_type": "debit", "date": "06.05.25 14:23", "amount": "52.00",
            "currency": "USD", "card": "***0018", "merchant": "TEST LLC"}"#
            .to_string()
    }

    #[tokio::test]
    async fn transactional_message_is_published() {
        let (worker, bus) = make_worker(Arc::new(FixedOracle(good_answer()))).await;
        let mut parsed = bus.subscribe(SUBJECT_PARSED, "writers").await.unwrap();

        let outcome = worker
            .process_payload(&raw_payload("Purchase 06.05.25 14:23 Amount:52.00"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Published);

        let delivery = parsed.next().await.unwrap();
        let txn: ParsedTransaction = serde_json::from_slice(delivery.payload()).unwrap();
        assert_eq!(txn.amount, Some(dec!(52.00)));
        delivery.ack();
    }

    #[tokio::test]
    async fn otp_message_skips_without_oracle_call() {
        let (worker, _bus) = make_worker(Arc::new(DownOracle)).await;
        // A down oracle would fail if called; the skip must never reach it.
        let outcome = worker
            .process_payload(&raw_payload("Your OTP is 482913"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(worker.metrics().snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_permanently() {
        let (worker, _bus) = make_worker(Arc::new(FixedOracle(good_answer()))).await;
        let outcome = worker.process_payload(b"not json").await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                reason: DeadLetterReason::ValidationFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn oracle_transport_failure_is_retryable() {
        let (worker, _bus) = make_worker(Arc::new(DownOracle)).await;
        let err = worker
            .process_payload(&raw_payload("Purchase 06.05.25 14:23 Amount:52.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Extraction(e) if e.retryable()));
    }

    #[tokio::test]
    async fn no_match_rejects_as_unmatched() {
        let answer = r#"{"transaction_type": null, "amount": null, "merchant": null}"#;
        let (worker, _bus) = make_worker(Arc::new(FixedOracle(answer.into()))).await;
        let outcome = worker
            .process_payload(&raw_payload("Hello from your bank"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                reason: DeadLetterReason::Unmatched,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn future_date_rejects_with_future_reason() {
        let future = (Utc::now() + chrono::Duration::days(2))
            .format("%d.%m.%Y %H:%M")
            .to_string();
        let answer = format!(
            r#"{{"transaction_type": "debit", "date": "{future}", "amount": "1.00", "merchant": "X"}}"#
        );
        let (worker, _bus) = make_worker(Arc::new(FixedOracle(answer))).await;
        let outcome = worker
            .process_payload(&raw_payload("no embedded dates"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Rejected {
                reason: DeadLetterReason::FutureDate,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dead_letter_records_store_row_and_failed_copy() {
        let (worker, bus) = make_worker(Arc::new(FixedOracle(good_answer()))).await;
        let mut failed = bus.subscribe(SUBJECT_FAILED, "observers").await.unwrap();

        worker
            .dead_letter(DeadLetterReason::Unmatched, b"payload", "nothing matched")
            .await
            .unwrap();

        let delivery = failed.next().await.unwrap();
        let letter: DeadLetter = serde_json::from_slice(delivery.payload()).unwrap();
        assert_eq!(letter.reason, DeadLetterReason::Unmatched);
        assert_eq!(letter.original_payload, "payload");
        delivery.ack();
        assert_eq!(worker.metrics().snapshot().unmatched, 1);
    }

    #[tokio::test]
    async fn run_loop_processes_and_acks() {
        let (worker, bus) = make_worker(Arc::new(FixedOracle(good_answer()))).await;
        let mut parsed = bus.subscribe(SUBJECT_PARSED, "writers").await.unwrap();
        // Create the group queue first so the publish cannot race run()'s
        // own subscribe call.
        drop(bus.subscribe(SUBJECT_RAW, "workers").await.unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.clone().run("workers", 4, shutdown_rx));

        bus.publish(
            SUBJECT_RAW,
            &raw_payload("Purchase 06.05.25 14:23 Amount:52.00"),
        )
        .await
        .unwrap();

        let delivery = parsed.next().await.unwrap();
        delivery.ack();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(bus.pending(SUBJECT_RAW, "workers").await.unwrap(), 0);
        assert_eq!(worker.metrics().snapshot().published, 1);
    }

    #[tokio::test]
    async fn run_loop_dead_letters_bad_payloads() {
        let (worker, bus) = make_worker(Arc::new(FixedOracle(good_answer()))).await;
        let mut failed = bus.subscribe(SUBJECT_FAILED, "observers").await.unwrap();
        drop(bus.subscribe(SUBJECT_RAW, "workers").await.unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.clone().run("workers", 4, shutdown_rx));

        bus.publish(SUBJECT_RAW, b"garbage").await.unwrap();
        let delivery = failed.next().await.unwrap();
        let letter: DeadLetter = serde_json::from_slice(delivery.payload()).unwrap();
        assert_eq!(letter.reason, DeadLetterReason::ValidationFailed);
        delivery.ack();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
