//! Error types for the SMS transaction pipeline.
//!
//! One enum per concern, folded into a top-level `Error`. Every failure a
//! message can hit maps to exactly one kind — there is no catch-all path.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Normalization failures. Always permanent: a string that does not parse
/// today will not parse on redelivery.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FormatError {
    #[error("Empty numeric string")]
    EmptyAmount,

    #[error("Unparseable amount '{original}' (cleaned to '{cleaned}')")]
    BadAmount { original: String, cleaned: String },

    #[error("Unparseable date/time '{0}'")]
    BadDateTime(String),
}

/// Extraction Adapter errors. `retryable()` is the single source of truth
/// for the worker's ack decision.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// Transport-level oracle failure (network, rate limit, 5xx). Retryable.
    #[error("Oracle call failed: {0}")]
    Oracle(String),

    /// Oracle answered but the payload is not the expected JSON shape.
    #[error("Invalid oracle response: {0}")]
    InvalidResponse(String),

    /// Oracle answered with the right shape but a field failed normalization
    /// or schema validation.
    #[error("Extraction validation failed: {0}")]
    Validation(String),

    /// Oracle could not recognize the message at all.
    #[error("Oracle found no transaction in message")]
    NoMatch,
}

impl ExtractionError {
    /// Whether the failure may succeed on redelivery.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Oracle(_))
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Publish to '{subject}' failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    #[error("Subscribe to '{subject}' failed: {reason}")]
    SubscribeFailed { subject: String, reason: String },

    #[error("Bus connection closed")]
    Closed,
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Upsert retries exhausted after {attempts} attempts over {elapsed:?}: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

/// Worker/writer orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed raw payload: {0}")]
    MalformedPayload(String),

    #[error("Transaction invariant violated: {0}")]
    InvariantViolated(String),

    #[error("Downstream publish failed: {0}")]
    Publish(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
