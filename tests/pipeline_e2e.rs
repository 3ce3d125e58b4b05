//! Integration tests for the full pipeline: bus → worker → writer → store,
//! plus dead-letter replay.
//!
//! Each test wires the real components against an in-memory bus and an
//! in-memory libSQL database; only the oracle is stubbed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tokio::time::timeout;

use sms_ledger::bus::{InMemoryBus, MessageBus, SUBJECT_RAW};
use sms_ledger::classify::Classifier;
use sms_ledger::error::ExtractionError;
use sms_ledger::extract::{ExtractionAdapter, Oracle};
use sms_ledger::inspector::DeadLetterInspector;
use sms_ledger::inspector::ReplayOutcome;
use sms_ledger::metrics::PipelineMetrics;
use sms_ledger::model::{DeadLetterReason, RawMessage, TransactionType};
use sms_ledger::pipeline::ParserWorker;
use sms_ledger::store::{DeadLetterStore, LibSqlStore, TransactionStore};
use sms_ledger::writer::{IdempotentWriter, RetryPolicy};

/// Maximum time any wait loop may spin before the test is considered hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Oracle stub that pops scripted answers and counts real calls.
struct ScriptedOracle {
    answers: std::sync::Mutex<Vec<Result<String, ExtractionError>>>,
    calls: AtomicU64,
}

impl ScriptedOracle {
    /// Later entries are popped first, so pass answers in reverse order of use.
    fn new(mut answers: Vec<Result<String, ExtractionError>>) -> Arc<Self> {
        answers.reverse();
        Arc::new(Self {
            answers: std::sync::Mutex::new(answers),
            calls: AtomicU64::new(0),
        })
    }

    fn always(answer: &str) -> Arc<Self> {
        Self::new(vec![Ok(answer.to_string())])
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, _body: &str) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            answers.pop().unwrap()
        } else {
            // Keep repeating the final scripted answer.
            match answers.last() {
                Some(Ok(s)) => Ok(s.clone()),
                Some(Err(_)) | None => Err(ExtractionError::Oracle("script exhausted".into())),
            }
        }
    }
}

struct Pipeline {
    bus: Arc<InMemoryBus>,
    store: Arc<LibSqlStore>,
    metrics: Arc<PipelineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<tokio::task::JoinHandle<Result<(), sms_ledger::error::Error>>>,
}

impl Pipeline {
    async fn start(oracle: Arc<dyn Oracle>) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let metrics = Arc::new(PipelineMetrics::new());

        let worker = Arc::new(ParserWorker::new(
            bus.clone(),
            Arc::new(ExtractionAdapter::new(oracle)),
            Classifier::default_markers(),
            store.clone(),
            metrics.clone(),
        ));
        let writer = Arc::new(IdempotentWriter::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            metrics.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        ));

        // Create the group queues up front so nothing published in a test
        // races the tasks' own subscribe calls.
        drop(bus.subscribe(SUBJECT_RAW, "workers").await.unwrap());
        drop(
            bus.subscribe(sms_ledger::bus::SUBJECT_PARSED, "writers")
                .await
                .unwrap(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(writer.run("writers", shutdown_rx.clone())),
            {
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker.run("workers", 4, shutdown).await })
            },
        ];

        Self {
            bus,
            store,
            metrics,
            shutdown_tx,
            handles,
        }
    }

    async fn publish_raw(&self, message: &RawMessage) {
        self.bus
            .publish(SUBJECT_RAW, &serde_json::to_vec(message).unwrap())
            .await
            .unwrap();
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        for handle in self.handles {
            handle.await.unwrap().unwrap();
        }
    }
}

async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn sample_body() -> &'static str {
    "APPROVED PURCHASE DB SALE: TEST LLC, MOSKOW, TEST STR. 29, 24 AREA,\
     06.05.25 14:23,card 4083***0018. Amount:52.00 USD, Balance:1842.74 USD"
}

fn sample_answer() -> &'static str {
    r#"{"transaction_type": "debit", "date": "06.05.25 14:23", "amount": "52.00",
        "currency": "USD", "card": "4083***0018", "merchant": "TEST LLC",
        "city": "MOSKOW", "address": "TEST STR. 29, 24 AREA", "balance": "1842.74"}"#
}

#[tokio::test]
async fn purchase_sms_lands_in_store_fully_normalized() {
    let oracle = ScriptedOracle::always(sample_answer());
    let pipeline = Pipeline::start(oracle).await;

    let message = RawMessage::new("BANK", sample_body(), Utc::now());
    pipeline.publish_raw(&message).await;

    let store = pipeline.store.clone();
    let id = message.message_id.clone();
    wait_until(|| {
        let store = store.clone();
        let id = id.clone();
        async move { store.get_transaction(&id).await.unwrap().is_some() }
    })
    .await;

    let txn = pipeline
        .store
        .get_transaction(&message.message_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(txn.transaction_type, TransactionType::Debit);
    assert_eq!(txn.amount, Some(dec!(52.00)));
    assert_eq!(txn.currency.as_deref(), Some("USD"));
    assert_eq!(txn.card_last4.as_deref(), Some("0018"));
    assert_eq!(txn.merchant.as_deref(), Some("TEST LLC"));
    assert_eq!(txn.city.as_deref(), Some("MOSKOW"));
    assert_eq!(txn.address.as_deref(), Some("TEST STR. 29, 24 AREA"));
    assert_eq!(txn.balance_after, Some(dec!(1842.74)));
    assert_eq!(
        txn.occurred_at,
        Utc.with_ymd_and_hms(2025, 5, 6, 14, 23, 0).unwrap()
    );
    assert_eq!(txn.raw_body, sample_body());

    pipeline.stop().await;
}

#[tokio::test]
async fn otp_sms_is_skipped_with_zero_oracle_calls() {
    let oracle = ScriptedOracle::always(sample_answer());
    let pipeline = Pipeline::start(oracle.clone()).await;

    pipeline
        .publish_raw(&RawMessage::new(
            "BANK",
            "Your OTP is 482913. Valid 5 minutes.",
            Utc::now(),
        ))
        .await;

    let metrics = pipeline.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.snapshot().skipped == 1 }
    })
    .await;

    assert_eq!(oracle.calls(), 0);
    assert_eq!(pipeline.store.count_transactions().await.unwrap(), 0);
    pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_delivery_converges_on_one_row_and_one_oracle_call() {
    let oracle = ScriptedOracle::always(sample_answer());
    let pipeline = Pipeline::start(oracle.clone()).await;

    let message = RawMessage::new("BANK", sample_body(), Utc::now());
    pipeline.publish_raw(&message).await;

    // First delivery populates the cache; the redeliveries must hit it.
    let metrics = pipeline.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.snapshot().written == 1 }
    })
    .await;

    pipeline.publish_raw(&message).await;
    pipeline.publish_raw(&message).await;

    let metrics = pipeline.metrics.clone();
    wait_until(|| {
        let metrics = metrics.clone();
        async move { metrics.snapshot().written == 3 }
    })
    .await;

    assert_eq!(oracle.calls(), 1, "cache must absorb duplicate bodies");
    assert_eq!(pipeline.store.count_transactions().await.unwrap(), 1);
    pipeline.stop().await;
}

#[tokio::test]
async fn future_dated_transaction_is_dead_lettered() {
    let future = (Utc::now() + chrono::Duration::days(3))
        .format("%d.%m.%Y %H:%M")
        .to_string();
    let answer = format!(
        r#"{{"transaction_type": "debit", "date": "{future}", "amount": "9.99", "merchant": "X"}}"#
    );
    let oracle = ScriptedOracle::always(&answer);
    let pipeline = Pipeline::start(oracle).await;

    pipeline
        .publish_raw(&RawMessage::new("BANK", "Purchase 9.99 USD", Utc::now()))
        .await;

    let store = pipeline.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { !store.list_dead_letters(None).await.unwrap().is_empty() }
    })
    .await;

    let letters = pipeline.store.list_dead_letters(None).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::FutureDate);
    assert_eq!(pipeline.store.count_transactions().await.unwrap(), 0);
    pipeline.stop().await;
}

#[tokio::test]
async fn oracle_outage_redelivers_until_recovery() {
    let oracle = ScriptedOracle::new(vec![
        Err(ExtractionError::Oracle("503".into())),
        Err(ExtractionError::Oracle("503".into())),
        Ok(sample_answer().to_string()),
    ]);
    let pipeline = Pipeline::start(oracle.clone()).await;

    let message = RawMessage::new("BANK", sample_body(), Utc::now());
    pipeline.publish_raw(&message).await;

    let store = pipeline.store.clone();
    let id = message.message_id.clone();
    wait_until(|| {
        let store = store.clone();
        let id = id.clone();
        async move { store.get_transaction(&id).await.unwrap().is_some() }
    })
    .await;

    assert!(oracle.calls() >= 3);
    assert!(pipeline.store.list_dead_letters(None).await.unwrap().is_empty());
    pipeline.stop().await;
}

#[tokio::test]
async fn prose_answer_is_dead_lettered_and_replayable_after_fix() {
    // First process: the oracle answers prose, so the message parks.
    let bad_oracle = ScriptedOracle::always("I am unable to parse this message");
    let pipeline = Pipeline::start(bad_oracle).await;

    let message = RawMessage::new("BANK", sample_body(), Utc::now());
    pipeline.publish_raw(&message).await;

    let store = pipeline.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { !store.list_dead_letters(None).await.unwrap().is_empty() }
    })
    .await;
    let letters = pipeline.store.list_dead_letters(None).await.unwrap();
    assert_eq!(letters[0].reason, DeadLetterReason::ExtractionFailed);
    let shared_store = pipeline.store.clone();
    pipeline.stop().await;

    // Second process against the same database: oracle fixed, replay works.
    let good = ScriptedOracle::always(sample_answer());
    let bus = Arc::new(InMemoryBus::new());
    let metrics = Arc::new(PipelineMetrics::new());
    let worker = Arc::new(ParserWorker::new(
        bus.clone(),
        Arc::new(ExtractionAdapter::new(good)),
        Classifier::default_markers(),
        shared_store.clone(),
        metrics.clone(),
    ));
    let writer = Arc::new(IdempotentWriter::new(
        bus.clone(),
        shared_store.clone(),
        shared_store.clone(),
        metrics,
        RetryPolicy::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Writer group queue must exist before the replay publishes.
    drop(
        bus.subscribe(sms_ledger::bus::SUBJECT_PARSED, "writers")
            .await
            .unwrap(),
    );
    let writer_handle = tokio::spawn(writer.clone().run("writers", shutdown_rx));

    let inspector = DeadLetterInspector::new(shared_store.clone(), worker, writer);
    let outcome = inspector.replay(letters[0].id).await.unwrap();
    assert_eq!(outcome, ReplayOutcome::Published);

    let store = shared_store.clone();
    let id = message.message_id.clone();
    wait_until(|| {
        let store = store.clone();
        let id = id.clone();
        async move { store.get_transaction(&id).await.unwrap().is_some() }
    })
    .await;
    assert!(shared_store.list_dead_letters(None).await.unwrap().is_empty());

    shutdown_tx.send(true).unwrap();
    writer_handle.await.unwrap().unwrap();
}
