//! Schema invariants checked before a transaction may leave the pipeline.
//!
//! Extraction already normalized field formats; this pass checks cross-field
//! rules that decide between publishing and dead-lettering. The writer runs
//! the same checks again before touching the store, because the parsed
//! subject is an open boundary — anything can publish to it.

use chrono::{DateTime, Duration, Utc};

use crate::model::{DeadLetterReason, ParsedTransaction, TransactionType};

/// Clock-skew allowance before a timestamp counts as "in the future".
const FUTURE_TOLERANCE_MINUTES: i64 = 5;

/// A failed invariant, carrying the dead-letter routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub reason: DeadLetterReason,
    pub detail: String,
}

impl ValidationFailure {
    fn new(reason: DeadLetterReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.detail)
    }
}

/// Check every invariant a publishable transaction must hold.
pub fn validate_transaction(
    txn: &ParsedTransaction,
    now: DateTime<Utc>,
) -> Result<(), ValidationFailure> {
    if txn.message_id.is_empty() {
        return Err(ValidationFailure::new(
            DeadLetterReason::ValidationFailed,
            "empty message_id",
        ));
    }

    // Debit/credit without an amount is not a usable ledger entry.
    if matches!(
        txn.transaction_type,
        TransactionType::Debit | TransactionType::Credit
    ) && txn.amount.is_none()
    {
        return Err(ValidationFailure::new(
            DeadLetterReason::ValidationFailed,
            format!("{} transaction without amount", txn.transaction_type.as_str()),
        ));
    }

    if let Some(amount) = txn.amount
        && amount.is_sign_negative()
    {
        return Err(ValidationFailure::new(
            DeadLetterReason::ValidationFailed,
            format!("negative amount {amount}"),
        ));
    }

    if let Some(ref card) = txn.card_last4
        && (card.len() != 4 || !card.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(ValidationFailure::new(
            DeadLetterReason::ValidationFailed,
            format!("card_last4 '{card}' is not four digits"),
        ));
    }

    if let Some(ref currency) = txn.currency
        && (currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()))
    {
        return Err(ValidationFailure::new(
            DeadLetterReason::ValidationFailed,
            format!("currency '{currency}' is not an ISO 4217 code"),
        ));
    }

    if txn.occurred_at > now + Duration::minutes(FUTURE_TOLERANCE_MINUTES) {
        return Err(ValidationFailure::new(
            DeadLetterReason::FutureDate,
            format!("occurred_at {} is in the future", txn.occurred_at.to_rfc3339()),
        ));
    }

    Ok(())
}
