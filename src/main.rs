use std::sync::Arc;

use sms_ledger::bus::{InMemoryBus, MessageBus, SUBJECT_PARSED, SUBJECT_RAW};
use sms_ledger::classify::Classifier;
use sms_ledger::config::PipelineConfig;
use sms_ledger::extract::{ExtractionAdapter, create_oracle};
use sms_ledger::metrics::PipelineMetrics;
use sms_ledger::model::RawMessage;
use sms_ledger::pipeline::ParserWorker;
use sms_ledger::store::LibSqlStore;
use sms_ledger::writer::IdempotentWriter;
use tokio::io::AsyncBufReadExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PipelineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export SMS_LEDGER_ORACLE_API_KEY=sk-...");
        std::process::exit(1);
    });

    eprintln!("SMS Ledger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.oracle.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Consumer group: {}", config.consumer_group);
    eprintln!("   Paste raw messages as JSON lines on stdin. Ctrl-C to exit.\n");

    // ── Store ────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlStore::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );

    // ── Oracle + classifier ──────────────────────────────────────────
    let oracle = create_oracle(&config.oracle)?;
    let adapter = Arc::new(ExtractionAdapter::new(oracle));

    let mut classifier = Classifier::default_markers();
    for marker in &config.extra_markers {
        classifier.add_marker(marker);
    }

    // ── Pipeline tasks ───────────────────────────────────────────────
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let metrics = Arc::new(PipelineMetrics::new());

    let worker = Arc::new(ParserWorker::new(
        bus.clone(),
        adapter,
        classifier,
        store.clone(),
        metrics.clone(),
    ));
    let writer = Arc::new(IdempotentWriter::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        metrics.clone(),
        config.retry.clone(),
    ));

    // Create the group queues before anything publishes, so early stdin
    // lines cannot slip past consumers that have not subscribed yet.
    drop(bus.subscribe(SUBJECT_RAW, &config.consumer_group).await?);
    drop(bus.subscribe(SUBJECT_PARSED, "sms-writers").await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let writer_handle = tokio::spawn(writer.run("sms-writers", shutdown_rx.clone()));
    let worker_handle = {
        let worker = worker.clone();
        let group = config.consumer_group.clone();
        let max_in_flight = config.max_in_flight;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { worker.run(&group, max_in_flight, shutdown).await })
    };

    // Periodic progress line: counters plus raw-subject backlog.
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let group = config.consumer_group.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let snap = metrics.snapshot();
                        let lag = bus.pending(SUBJECT_RAW, &group).await.unwrap_or(0);
                        tracing::info!(
                            received = snap.received,
                            published = snap.published,
                            written = snap.written,
                            skipped = snap.skipped,
                            dead_lettered = snap.dead_lettered(),
                            lag,
                            "Pipeline progress"
                        );
                    }
                }
            }
        });
    }

    // ── Stdin ingest ─────────────────────────────────────────────────
    // Lines are either a full RawMessage JSON object or `SENDER|body text`,
    // for which the content-hash ID and arrival time are derived here.
    {
        let bus = bus.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let message = match serde_json::from_str::<RawMessage>(&line) {
                    Ok(msg) => msg,
                    Err(_) => match line.split_once('|') {
                        Some((sender, body)) => {
                            RawMessage::new(sender.trim(), body.trim(), chrono::Utc::now())
                        }
                        None => {
                            eprintln!("Unrecognized input line (want JSON or SENDER|body)");
                            continue;
                        }
                    },
                };
                match serde_json::to_vec(&message) {
                    Ok(payload) => {
                        if let Err(e) = bus.publish(SUBJECT_RAW, &payload).await {
                            tracing::warn!(error = %e, "Failed to publish raw message");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize raw message"),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down, draining in-flight messages...");
    shutdown_tx.send(true).ok();
    worker_handle.await??;
    writer_handle.await??;

    let snap = metrics.snapshot();
    eprintln!(
        "Done. received={} written={} skipped={} dead_lettered={}",
        snap.received,
        snap.written,
        snap.skipped,
        snap.dead_lettered()
    );
    Ok(())
}
