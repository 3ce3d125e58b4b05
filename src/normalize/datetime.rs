//! Date/time reconciliation for oracle-returned timestamps.
//!
//! Bank SMS timestamps are `dd.mm.yy hh:mm` local time with no zone, and the
//! oracle sometimes re-renders them in a different locale order or with a
//! corrupted date. Two repairs run against the raw body as ground truth:
//!
//! 1. an embedded `dd.mm.yy(yy)` token in the body that differs from the
//!    parsed date replaces the date component, keeping the time of day;
//! 2. if the day/month-swapped rendering appears verbatim in the body while
//!    the unswapped one does not, the swap is applied.
//!
//! The swap heuristic is inherently ambiguous when day <= 12 and neither
//! rendering appears in the body; in that case the parsed value stands.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use crate::error::FormatError;

/// Primary format family: day.month.year with 2- or 4-digit years and
/// interchangeable separators.
const PRIMARY_FORMATS: &[&str] = &[
    "%d.%m.%y %H:%M",
    "%d.%m.%Y %H:%M",
    "%d/%m/%y %H:%M",
    "%d/%m/%Y %H:%M",
    "%d-%m-%y %H:%M",
    "%d-%m-%Y %H:%M",
];

/// Free-form fallbacks for oracle output that drifted from the SMS format.
const FALLBACK_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

static DATE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2})[./-](\d{2})[./-](\d{4}|\d{2})").expect("date token regex")
});

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").expect("iso date regex"));

/// Parse an oracle-returned date/time string, reconciling it against the raw
/// message body and falling back to the message's own arrival time when the
/// text carries no literal date at all.
pub fn parse_datetime(
    text: &str,
    raw_body: &str,
    fallback: DateTime<Utc>,
) -> Result<DateTime<Utc>, FormatError> {
    let trimmed = text.trim();

    let parsed = parse_literal(trimmed);

    let parsed = match parsed {
        Some(dt) => dt,
        None => {
            if contains_date_token(trimmed) {
                // There is date text we could not read — permanent failure.
                return Err(FormatError::BadDateTime(text.to_string()));
            }
            // No literal date in the oracle answer; the arrival timestamp is
            // the best remaining signal.
            fallback.naive_utc()
        }
    };

    let repaired = repair_from_body(parsed, raw_body);
    Ok(repaired.and_utc())
}

/// Try the known format tables plus RFC 3339.
fn parse_literal(text: &str) -> Option<NaiveDateTime> {
    if text.is_empty() {
        return None;
    }
    for fmt in PRIMARY_FORMATS.iter().chain(FALLBACK_FORMATS) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    None
}

fn contains_date_token(text: &str) -> bool {
    DATE_TOKEN_RE.is_match(text) || ISO_DATE_RE.is_match(text)
}

/// Apply both body-grounded repairs: embedded-token replacement, then the
/// day/month swap. The second is a no-op whenever the first fired, since the
/// repaired date is by construction a substring of the body.
fn repair_from_body(parsed: NaiveDateTime, raw_body: &str) -> NaiveDateTime {
    let with_embedded = apply_embedded_date(parsed, raw_body);
    apply_day_month_swap(with_embedded, raw_body)
}

/// If the body carries a literal `dd.mm.yy(yy)` token naming a different
/// date, trust the body's date and keep the parsed time of day. This repairs
/// a known upstream corruption class without discarding intraday precision.
fn apply_embedded_date(parsed: NaiveDateTime, raw_body: &str) -> NaiveDateTime {
    let Some(caps) = DATE_TOKEN_RE.captures(raw_body) else {
        return parsed;
    };
    let (day, month, year) = (
        caps[1].parse::<u32>().unwrap_or(0),
        caps[2].parse::<u32>().unwrap_or(0),
        expand_year(caps[3].parse::<i32>().unwrap_or(0)),
    );
    let Some(embedded) = NaiveDate::from_ymd_opt(year, month, day) else {
        return parsed;
    };
    if embedded == parsed.date() {
        return parsed;
    }
    NaiveDateTime::new(embedded, parsed.time())
}

/// Swap day and month only when the swapped rendering is literally present
/// in the body and the unswapped one is not.
fn apply_day_month_swap(parsed: NaiveDateTime, raw_body: &str) -> NaiveDateTime {
    let date = parsed.date();
    if body_contains_date(raw_body, date) {
        return parsed;
    }
    let Some(swapped) = swap_day_month(date) else {
        return parsed;
    };
    if body_contains_date(raw_body, swapped) {
        return NaiveDateTime::new(swapped, parsed.time());
    }
    parsed
}

fn swap_day_month(date: NaiveDate) -> Option<NaiveDate> {
    use chrono::Datelike;
    let day = date.day();
    let month = date.month();
    if day > 12 || day == month {
        return None;
    }
    NaiveDate::from_ymd_opt(date.year(), day, month)
}

/// Whether any common rendering of `date` appears verbatim in the body.
fn body_contains_date(raw_body: &str, date: NaiveDate) -> bool {
    const RENDERINGS: &[&str] = &[
        "%d.%m.%y", "%d.%m.%Y", "%d/%m/%y", "%d/%m/%Y", "%d-%m-%y", "%d-%m-%Y",
    ];
    RENDERINGS
        .iter()
        .any(|fmt| raw_body.contains(&date.format(fmt).to_string()))
}

/// 2-digit years are 2000-based.
fn expand_year(year: i32) -> i32 {
    if year < 100 { year + 2000 } else { year }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDateTime::new(
            NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            NaiveTime::from_hms_opt(h, min, 0).unwrap(),
        )
    }

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn parses_primary_two_digit_year() {
        let dt = parse_datetime("06.05.25 14:23", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 5, 6, 14, 23));
    }

    #[test]
    fn parses_primary_four_digit_year() {
        let dt = parse_datetime("10.06.2025 20:51", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 6, 10, 20, 51));
    }

    #[test]
    fn parses_slash_and_dash_separators() {
        let dt = parse_datetime("06/10/25 20:51", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 10, 6, 20, 51));
        let dt = parse_datetime("06-10-25 20:51", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 10, 6, 20, 51));
    }

    #[test]
    fn parses_free_form_iso() {
        let dt = parse_datetime("2025-06-10 20:51:00", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 6, 10, 20, 51));
        let dt = parse_datetime("2025-06-10T20:51:00+00:00", "", fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 6, 10, 20, 51));
    }

    #[test]
    fn embedded_body_date_overrides_swapped_oracle_date() {
        // Oracle re-rendered the SMS date with day and month swapped; the
        // body token is ground truth, the time of day is preserved.
        let body = "Purchase 10.06.2025 20:51 card ***0018";
        let dt = parse_datetime("06/10/25 20:51", body, fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 6, 10, 20, 51));
    }

    #[test]
    fn embedded_body_date_preserves_parsed_time() {
        let body = "CREDIT 01.02.25 09:00";
        // Oracle got the date wrong but the time right.
        let dt = parse_datetime("03.02.25 09:17", body, fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 2, 1, 9, 17));
    }

    #[test]
    fn matching_body_date_left_untouched() {
        let body = "Purchase 06.05.25 14:23 Amount:52.00";
        let dt = parse_datetime("06.05.25 14:23", body, fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 5, 6, 14, 23));
    }

    #[test]
    fn swap_applies_when_only_swapped_rendering_in_body() {
        // First body token is not a valid d.m.y date, so the embedded repair
        // stands down; "05.06.25" is literally present while "06.05.25" is
        // not, so the swap fires.
        let body = "ref 05.21.25, paid 05.06.25 at the shop";
        let dt = parse_datetime("06.05.2025 11:00", body, fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 6, 5, 11, 0));
    }

    #[test]
    fn swap_not_applied_when_neither_rendering_present() {
        let body = "no dates here";
        let dt = parse_datetime("06.05.25 11:00", body, fallback()).unwrap();
        assert_eq!(dt.naive_utc(), at(2025, 5, 6, 11, 0));
    }

    #[test]
    fn no_date_text_falls_back_to_arrival_time() {
        let dt = parse_datetime("", "body without dates", fallback()).unwrap();
        assert_eq!(dt, fallback());
        let dt = parse_datetime("null", "body", fallback()).unwrap();
        assert_eq!(dt, fallback());
    }

    #[test]
    fn unreadable_date_text_is_permanent_error() {
        let err = parse_datetime("99.99.99 12:00", "", fallback());
        assert!(matches!(err, Err(FormatError::BadDateTime(_))));
    }

    #[test]
    fn swap_skipped_for_day_above_twelve() {
        assert!(swap_day_month(NaiveDate::from_ymd_opt(2025, 5, 13).unwrap()).is_none());
    }

    #[test]
    fn two_digit_years_are_2000_based() {
        assert_eq!(expand_year(25), 2025);
        assert_eq!(expand_year(1999), 1999);
    }
}
