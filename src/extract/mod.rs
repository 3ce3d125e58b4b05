//! Extraction Adapter — oracle calls, content-hash caching, normalization.
//!
//! Flow for one message:
//! 1. sha256 of the raw body → cache lookup; a hit skips the oracle entirely
//! 2. miss → mask card numbers, call the oracle, cache the raw answer
//! 3. parse the answer as strict JSON and normalize every field
//!
//! The cache key is the pre-masked body so re-imports and redeliveries of the
//! same SMS converge on one oracle call regardless of masking changes. The
//! cached value is the oracle's raw answer, not the normalized record:
//! normalization is deterministic and cheap, and re-running it keeps cached
//! entries valid across parser fixes within a process lifetime.

pub mod oracle;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::model::{PARSER_VERSION, ParsedTransaction, RawMessage, TransactionType, hex_encode};
use crate::normalize::{card, mask_card, parse_amount, parse_datetime};

pub use oracle::{Oracle, OracleBackend, OracleConfig, create_oracle};

use oracle::extract_json_object;

/// Turns raw messages into normalized transactions via the oracle, with a
/// mandatory content-hash cache in front of it.
pub struct ExtractionAdapter {
    oracle: Arc<dyn Oracle>,
    /// Raw oracle answers keyed by sha256(body).
    cache: RwLock<HashMap<String, String>>,
    oracle_calls: AtomicU64,
}

impl ExtractionAdapter {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            cache: RwLock::new(HashMap::new()),
            oracle_calls: AtomicU64::new(0),
        }
    }

    /// Number of real oracle calls made so far (cache hits excluded).
    pub fn oracle_calls(&self) -> u64 {
        self.oracle_calls.load(Ordering::Relaxed)
    }

    /// Extract and normalize one message.
    ///
    /// Only `ExtractionError::Oracle` is retryable; every other variant will
    /// recur on redelivery and must be dead-lettered by the caller.
    pub async fn extract(
        &self,
        message: &RawMessage,
    ) -> Result<ParsedTransaction, ExtractionError> {
        let cache_key = body_hash(&message.body);

        let answer = {
            let cache = self.cache.read().await;
            cache.get(&cache_key).cloned()
        };

        let answer = match answer {
            Some(cached) => {
                debug!(message_id = %message.message_id, "Extraction cache hit");
                cached
            }
            None => {
                let masked = mask_card(&message.body);
                let answer = self.oracle.extract(&masked).await?;
                self.oracle_calls.fetch_add(1, Ordering::Relaxed);
                self.cache
                    .write()
                    .await
                    .insert(cache_key, answer.clone());
                answer
            }
        };

        normalize_answer(&answer, message)
    }
}

/// sha256 hex of the raw body, the cache key.
pub fn body_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex_encode(&hasher.finalize())
}

// ── Answer parsing ──────────────────────────────────────────────────

/// Oracle answer as received, every field untrusted text.
#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default, deserialize_with = "loose_opt_string")]
    transaction_type: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    date: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    amount: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    currency: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    card: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    merchant: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    city: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    address: Option<String>,
    #[serde(default, deserialize_with = "loose_opt_string")]
    balance: Option<String>,
}

/// Accept string, number, or null — oracles are inconsistent about quoting
/// numeric fields despite the prompt.
fn loose_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

/// The literal strings "null"/"none"/"n/a" arrive often enough to treat as
/// absent; so do blank fields.
fn opt_field(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "null" | "none" | "n/a" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Parse and normalize the oracle answer into a `ParsedTransaction`.
fn normalize_answer(
    answer: &str,
    message: &RawMessage,
) -> Result<ParsedTransaction, ExtractionError> {
    let json = extract_json_object(answer);
    let raw: RawExtraction = serde_json::from_str(&json)
        .map_err(|e| ExtractionError::InvalidResponse(format!("JSON parse error: {e}")))?;

    let type_field = opt_field(raw.transaction_type);
    let amount_field = opt_field(raw.amount);
    let merchant = opt_field(raw.merchant);

    let transaction_type = type_field
        .as_deref()
        .and_then(TransactionType::from_str_loose);

    // An answer carrying no direction, no amount and no merchant is the
    // oracle's way of declining the message.
    if transaction_type.is_none() && amount_field.is_none() && merchant.is_none() {
        return Err(ExtractionError::NoMatch);
    }

    let amount = amount_field
        .as_deref()
        .map(parse_amount)
        .transpose()
        .map_err(|e| ExtractionError::Validation(format!("amount: {e}")))?;

    let occurred_at = parse_datetime(
        opt_field(raw.date).as_deref().unwrap_or(""),
        &message.body,
        message.device_timestamp,
    )
    .map_err(|e| ExtractionError::Validation(format!("date: {e}")))?;

    let card_last4 = opt_field(raw.card).and_then(|c| card::card_last4(&c));

    // Balance is auxiliary: a malformed one degrades to absent instead of
    // failing the whole extraction.
    let balance_after = opt_field(raw.balance).and_then(|b| match parse_amount(&b) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(message_id = %message.message_id, error = %e, "Dropping unparseable balance");
            None
        }
    });

    Ok(ParsedTransaction {
        message_id: message.message_id.clone(),
        device_id: message.device_id.clone(),
        sender: message.sender.clone(),
        occurred_at,
        raw_body: message.body.clone(),
        transaction_type: transaction_type.unwrap_or(TransactionType::Unknown),
        amount,
        currency: opt_field(raw.currency).map(|c| c.to_uppercase()),
        card_last4,
        merchant,
        city: opt_field(raw.city),
        address: opt_field(raw.address),
        balance_after,
        parser_version: PARSER_VERSION.to_string(),
    })
}
