//! Domain records shared by every pipeline stage.
//!
//! The system intentionally passes around only these types (JSON-serialized)
//! across bus subjects so every component speaks the same language. Each
//! boundary re-validates with serde; loose maps never cross a seam.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Version stamped on every record this parser produces.
pub const PARSER_VERSION: &str = "llm-0.2.0";

// ── Raw message ─────────────────────────────────────────────────────

/// Where a raw message entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Forwarded live from a phone.
    Device,
    /// Imported from a backup file.
    Backup,
}

impl Default for MessageSource {
    fn default() -> Self {
        Self::Device
    }
}

/// An SMS exactly as received by an ingester, prior to any parsing.
///
/// Immutable once created. The same message may be delivered to the worker
/// more than once; `message_id` is what lets downstream converge duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Stable unique ID; defaults to a content hash of sender + body.
    pub message_id: String,
    /// Short code or number the bank sent from.
    pub sender: String,
    /// Full notification text.
    pub body: String,
    /// Arrival time recorded on the device.
    pub device_timestamp: DateTime<Utc>,
    /// IMEI or custom device identifier, absent for backup imports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub source: MessageSource,
}

impl RawMessage {
    /// Build a raw message with a derived content-hash ID.
    pub fn new(sender: &str, body: &str, device_timestamp: DateTime<Utc>) -> Self {
        Self {
            message_id: derive_message_id(sender, body),
            sender: sender.to_string(),
            body: body.to_string(),
            device_timestamp,
            device_id: None,
            source: MessageSource::Device,
        }
    }

    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn with_source(mut self, source: MessageSource) -> Self {
        self.source = source;
        self
    }
}

/// SHA-256 of `sender + body`, hex-encoded. Identical content always maps to
/// the same ID, which is what makes redelivery and re-import convergent.
pub fn derive_message_id(sender: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(body.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Lowercase hex of a digest.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

// ── Classification ──────────────────────────────────────────────────

/// Intent of a message, decided from raw text alone. Ephemeral — never
/// persisted, never put on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Looks like a financial transaction; goes to extraction.
    Transactional,
    /// One-time code / service notice; skipped without an oracle call.
    OneTimeCode,
    /// Nothing matched and extraction declined it.
    Unrecognized,
}

impl Classification {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transactional => "transactional",
            Self::OneTimeCode => "one_time_code",
            Self::Unrecognized => "unrecognized",
        }
    }
}

// ── Parsed transaction ──────────────────────────────────────────────

/// Direction of money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Debit,
    Credit,
    Unknown,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debit" => Some(Self::Debit),
            "credit" => Some(Self::Credit),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Fully normalized result of parsing one bank SMS.
///
/// Created by the worker, owned thereafter by the writer, which is the sole
/// mutator via upsert keyed on `message_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub sender: String,
    /// When the transaction happened according to the message itself.
    pub occurred_at: DateTime<Utc>,
    /// Original SMS text, kept verbatim for audit and replay.
    pub raw_body: String,
    pub transaction_type: TransactionType,
    /// Exact decimal, scale 2, non-negative. Required for Debit/Credit.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub amount: Option<Decimal>,
    /// ISO 4217 code (e.g. AMD, USD, EUR).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Exactly four digits when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_last4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Account balance after the operation, when the bank includes it.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub balance_after: Option<Decimal>,
    pub parser_version: String,
}

// ── Dead letters ────────────────────────────────────────────────────

/// Why a message was routed to the dead-letter holding area.
///
/// Reasons are deliberately distinct so operators can separate "bad upstream
/// data" from "bad parsing" from "store outage".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload or oracle answer failed schema/normalization checks.
    ValidationFailed,
    /// The oracle itself errored permanently.
    ExtractionFailed,
    /// The oracle answered but recognized no transaction.
    Unmatched,
    /// Parsed occurred_at is later than processing time.
    FutureDate,
    /// The writer exhausted its upsert retries.
    StoreWriteExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::ExtractionFailed => "extraction_failed",
            Self::Unmatched => "unmatched",
            Self::FutureDate => "future_date",
            Self::StoreWriteExhausted => "store_write_exhausted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation_failed" => Some(Self::ValidationFailed),
            "extraction_failed" => Some(Self::ExtractionFailed),
            "unmatched" => Some(Self::Unmatched),
            "future_date" => Some(Self::FutureDate),
            "store_write_exhausted" => Some(Self::StoreWriteExhausted),
            _ => None,
        }
    }
}

/// A permanently failed message parked for operator review.
///
/// Append-only; removed only by the Inspector after a successful replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub reason: DeadLetterReason,
    /// The raw payload exactly as it arrived on the bus.
    pub original_payload: String,
    pub error_detail: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(reason: DeadLetterReason, original_payload: &str, error_detail: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            original_payload: original_payload.to_string(),
            error_detail: error_detail.to_string(),
            timestamp: Utc::now(),
        }
    }
}
