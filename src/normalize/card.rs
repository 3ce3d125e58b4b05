//! Card-number format cleanup.
//!
//! Gateways render masked PANs as `4083***0018`, `4083 ••• 0018`, or with
//! non-breaking spaces around the mask. Everything downstream matches on a
//! single canonical tag carrying only the last four digits.

use std::sync::LazyLock;

use regex::Regex;

/// `dddd` + mask run + `dddd`, tolerating NBSP padding and bullet characters
/// substituted for asterisks.
static MASKED_PAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}[\s\u{a0}]*[*\u{2022}]{2,}[\s\u{a0}]*(\d{4})").expect("masked PAN regex")
});

/// Replace masked card patterns with a `***dddd` tag before any downstream
/// matching, so formatting noise never reaches the extraction layer.
pub fn mask_card(text: &str) -> String {
    MASKED_PAN_RE.replace_all(text, "***$1").into_owned()
}

/// Pull the last four digits out of an oracle-returned card field, which may
/// arrive as `***0018`, `•••0018`, `4083***0018` or just `0018`.
pub fn card_last4(field: &str) -> Option<String> {
    let digits: String = field.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].to_string())
}
