//! Ambiguous numeric string → exact decimal.
//!
//! Banks render the same amount as `79,825.89`, `79.825,89` or `1 000,50`
//! depending on locale. The heuristic: when both separators appear, the one
//! occurring later in the string is the decimal separator; a lone separator
//! is decimal unless it looks like a thousands group.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::FormatError;

/// Parse an amount string of unknown locale into an exact `Decimal`.
///
/// Permanent failure: an unparseable amount will not improve on redelivery,
/// so callers must treat `FormatError` as non-retryable.
pub fn parse_amount(text: &str) -> Result<Decimal, FormatError> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return Err(FormatError::EmptyAmount);
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let resolved = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            if comma > dot {
                // "79.825,89" — dots are thousands, comma is decimal
                cleaned.replace('.', "").replace(',', ".")
            } else {
                // "79,825.89" — commas are thousands
                cleaned.replace(',', "")
            }
        }
        (None, Some(comma)) => {
            let comma_count = cleaned.matches(',').count();
            let tail = &cleaned[comma + 1..];
            if comma_count > 1 {
                // "1,234,567" — all thousands
                cleaned.replace(',', "")
            } else if tail.len() == 3 && tail.chars().all(|c| c.is_ascii_digit()) {
                // "1,000" — a single trailing 3-digit group reads as a
                // thousands separator, not one thousandth
                cleaned.replace(',', "")
            } else {
                // "1,23" — decimal separator
                cleaned.replace(',', ".")
            }
        }
        (Some(dot), None) => {
            let dot_count = cleaned.matches('.').count();
            if dot_count > 1 {
                // "1.234.567" — all but the last are thousands separators
                let (head, tail) = cleaned.split_at(dot);
                format!("{}{}", head.replace('.', ""), tail)
            } else {
                cleaned.clone()
            }
        }
        (None, None) => cleaned.clone(),
    };

    // Drop currency symbols and other stray characters
    let digits: String = resolved
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    if digits.is_empty() {
        return Err(FormatError::BadAmount {
            original: text.to_string(),
            cleaned: digits,
        });
    }

    Decimal::from_str(&digits).map_err(|_| FormatError::BadAmount {
        original: text.to_string(),
        cleaned: digits,
    })
}
