//! Pre-oracle classifier for fast marker matching.
//!
//! Runs before the extraction oracle to short-circuit obvious non-transaction
//! traffic: one-time codes, declined-operation notices, and person-to-person
//! service chatter. A marker hit means the oracle is never called for that
//! message, so markers are deliberately conservative.
//!
//! Markers match case-insensitively as plain substrings against the raw body.
//! Marker order carries no meaning; the first hit wins only for the logged
//! label.

use tracing::debug;

use crate::model::{Classification, RawMessage};

/// Substrings that mark a message as a one-time code or service notice.
const DEFAULT_SKIP_MARKERS: &[&str] = &[
    "OTP",
    "CODE:",
    "PASS:",
    "PASS=",
    "NOT ENOUGH FUNDS",
    "INSUFFICIENT FUNDS",
    "CREDIT PAYMENT",
    "C2C RECEIVED",
    "DAILY LIMIT EXCEEDED",
    "PERSON TO PERSON",
];

/// Marker-based classifier deciding whether a message is worth an oracle call.
pub struct Classifier {
    /// Skip markers, stored uppercased for case-insensitive matching.
    skip_markers: Vec<String>,
}

impl Classifier {
    /// Classifier with the default marker set.
    pub fn default_markers() -> Self {
        Self {
            skip_markers: DEFAULT_SKIP_MARKERS
                .iter()
                .map(|m| m.to_uppercase())
                .collect(),
        }
    }

    /// Classifier with no markers (for testing): everything is transactional.
    pub fn empty() -> Self {
        Self {
            skip_markers: Vec::new(),
        }
    }

    /// Append a deployment-specific marker to the default set.
    pub fn add_marker(&mut self, marker: &str) {
        let marker = marker.trim().to_uppercase();
        if !marker.is_empty() && !self.skip_markers.contains(&marker) {
            self.skip_markers.push(marker);
        }
    }

    /// Classify a raw message from its text alone.
    ///
    /// `OneTimeCode` short-circuits extraction entirely; `Transactional` means
    /// the message proceeds to the oracle. `Unrecognized` is never produced
    /// here — only extraction can decline a message.
    pub fn classify(&self, message: &RawMessage) -> Classification {
        let body_upper = message.body.to_uppercase();
        for marker in &self.skip_markers {
            if body_upper.contains(marker.as_str()) {
                debug!(
                    message_id = %message.message_id,
                    marker = %marker,
                    "Skip marker matched, bypassing extraction"
                );
                return Classification::OneTimeCode;
            }
        }
        Classification::Transactional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(body: &str) -> RawMessage {
        RawMessage::new("BANK", body, Utc::now())
    }

    #[test]
    fn otp_body_is_skipped() {
        let classifier = Classifier::default_markers();
        let result = classifier.classify(&msg("Your OTP is 482913. Do not share it."));
        assert_eq!(result, Classification::OneTimeCode);
    }

    #[test]
    fn markers_match_case_insensitively() {
        let classifier = Classifier::default_markers();
        assert_eq!(
            classifier.classify(&msg("your otp is 1111")),
            Classification::OneTimeCode
        );
        assert_eq!(
            classifier.classify(&msg("Code: 9912 expires in 5 min")),
            Classification::OneTimeCode
        );
    }

    #[test]
    fn declined_operation_is_skipped() {
        let classifier = Classifier::default_markers();
        assert_eq!(
            classifier.classify(&msg("PURCHASE DECLINED: NOT ENOUGH FUNDS on card ***0018")),
            Classification::OneTimeCode
        );
        assert_eq!(
            classifier.classify(&msg("Daily limit exceeded for card ***0018")),
            Classification::OneTimeCode
        );
    }

    #[test]
    fn purchase_body_is_transactional() {
        let classifier = Classifier::default_markers();
        let body = "APPROVED PURCHASE DB SALE: TEST LLC, MOSKOW, 06.05.25 14:23, \
                    card ***0018. Amount:52.00 USD, Balance:1842.74 USD";
        assert_eq!(classifier.classify(&msg(body)), Classification::Transactional);
    }

    #[test]
    fn marker_inside_a_longer_word_still_matches() {
        // Plain substring semantics: cheap, predictable, occasionally eager.
        let classifier = Classifier::default_markers();
        assert_eq!(
            classifier.classify(&msg("PASSCODE: 1234")),
            Classification::OneTimeCode
        );
    }

    #[test]
    fn custom_marker_extends_defaults() {
        let mut classifier = Classifier::default_markers();
        classifier.add_marker("cashback accrued");
        assert_eq!(
            classifier.classify(&msg("Cashback accrued: 1.50 USD")),
            Classification::OneTimeCode
        );
        // Defaults still active
        assert_eq!(
            classifier.classify(&msg("OTP 111222")),
            Classification::OneTimeCode
        );
    }

    #[test]
    fn duplicate_and_blank_markers_are_dropped() {
        let mut classifier = Classifier::empty();
        classifier.add_marker("OTP");
        classifier.add_marker("otp");
        classifier.add_marker("   ");
        assert_eq!(classifier.skip_markers.len(), 1);
    }

    #[test]
    fn empty_classifier_passes_everything() {
        let classifier = Classifier::empty();
        assert_eq!(
            classifier.classify(&msg("Your OTP is 482913")),
            Classification::Transactional
        );
    }
}
