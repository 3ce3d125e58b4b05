//! Operator CLI for the dead-letter holding area.
//!
//! `list` and `delete` touch only the database. `replay` wires up the real
//! pipeline (oracle included), so a raw-message replay goes through
//! classification and extraction exactly as live traffic would.

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use sms_ledger::bus::{InMemoryBus, MessageBus, SUBJECT_PARSED};
use sms_ledger::classify::Classifier;
use sms_ledger::config::PipelineConfig;
use sms_ledger::extract::{ExtractionAdapter, create_oracle};
use sms_ledger::inspector::{DeadLetterInspector, ReplayOutcome};
use sms_ledger::metrics::PipelineMetrics;
use sms_ledger::model::DeadLetterReason;
use sms_ledger::pipeline::ParserWorker;
use sms_ledger::store::LibSqlStore;
use sms_ledger::writer::IdempotentWriter;

#[derive(Debug, Parser)]
#[command(name = "dlq", about = "Inspect and replay dead-lettered messages")]
struct DlqCli {
    #[command(subcommand)]
    command: DlqCommand,
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List parked dead letters.
    List {
        /// Narrow to one reason (e.g. future_date, store_write_exhausted).
        #[arg(long = "reason", value_parser = parse_reason)]
        reason: Option<DeadLetterReason>,
    },
    /// Re-run a parked payload through the pipeline; deletes it on success.
    Replay {
        #[arg(value_name = "LETTER_ID")]
        id: Uuid,
    },
    /// Remove a letter without replaying it.
    Delete {
        #[arg(value_name = "LETTER_ID")]
        id: Uuid,
    },
}

fn parse_reason(raw: &str) -> Result<DeadLetterReason, String> {
    DeadLetterReason::parse(raw).ok_or_else(|| format!("unknown reason '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = DlqCli::parse();
    let config = PipelineConfig::from_env()?;
    let store = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    match cli.command {
        DlqCommand::List { reason } => {
            let letters = store_list(&store, reason).await?;
            if letters.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }
            for letter in letters {
                println!(
                    "{}  {:24}  {}  {}",
                    letter.id,
                    letter.reason.as_str(),
                    letter.timestamp.to_rfc3339(),
                    letter.error_detail
                );
            }
        }
        DlqCommand::Delete { id } => {
            use sms_ledger::store::DeadLetterStore;
            store.delete_dead_letter(id).await?;
            println!("Deleted {id}");
        }
        DlqCommand::Replay { id } => {
            replay(config, store, id).await?;
        }
    }
    Ok(())
}

async fn store_list(
    store: &Arc<LibSqlStore>,
    reason: Option<DeadLetterReason>,
) -> Result<Vec<sms_ledger::model::DeadLetter>> {
    use sms_ledger::store::DeadLetterStore;
    Ok(store.list_dead_letters(reason).await?)
}

/// Build the full pipeline and replay one letter through it. A raw-message
/// replay publishes to the parsed subject, so a writer drains it before the
/// process exits.
async fn replay(config: PipelineConfig, store: Arc<LibSqlStore>, id: Uuid) -> Result<()> {
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let metrics = Arc::new(PipelineMetrics::new());
    let oracle = create_oracle(&config.oracle)?;

    let mut classifier = Classifier::default_markers();
    for marker in &config.extra_markers {
        classifier.add_marker(marker);
    }

    let worker = Arc::new(ParserWorker::new(
        bus.clone(),
        Arc::new(ExtractionAdapter::new(oracle)),
        classifier,
        store.clone(),
        metrics.clone(),
    ));
    let writer = Arc::new(IdempotentWriter::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        metrics,
        config.retry.clone(),
    ));

    // Create the writer's group queue before anything publishes, so a
    // replayed message cannot slip past a not-yet-subscribed writer.
    drop(bus.subscribe(SUBJECT_PARSED, "dlq-replay").await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let writer_handle = tokio::spawn(writer.clone().run("dlq-replay", shutdown_rx));

    let inspector = DeadLetterInspector::new(store, worker, writer);
    let outcome = inspector.replay(id).await;

    // Let the writer drain anything the replay published.
    while bus.pending(SUBJECT_PARSED, "dlq-replay").await? > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    shutdown_tx.send(true).ok();
    let _ = writer_handle.await;

    match outcome? {
        ReplayOutcome::Published => println!("Replayed {id}: published and written"),
        ReplayOutcome::Written => println!("Replayed {id}: written to store"),
        ReplayOutcome::Skipped => {
            println!("Replay of {id} classified the message as non-transactional; letter kept")
        }
        ReplayOutcome::Rejected { reason, detail } => {
            bail!("replay failed again ({}): {detail}", reason.as_str())
        }
    }
    Ok(())
}
