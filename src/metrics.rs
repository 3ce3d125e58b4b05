//! Process-local pipeline counters.
//!
//! Plain atomics, read for the service's periodic progress line and the
//! shutdown summary. Counters only ever increase; a restart resets them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::model::DeadLetterReason;

/// Counters shared across worker and writer tasks.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    received: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    written: AtomicU64,
    validation_failed: AtomicU64,
    extraction_failed: AtomicU64,
    unmatched: AtomicU64,
    future_date: AtomicU64,
    store_write_exhausted: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub skipped: u64,
    pub published: u64,
    pub written: u64,
    pub validation_failed: u64,
    pub extraction_failed: u64,
    pub unmatched: u64,
    pub future_date: u64,
    pub store_write_exhausted: u64,
}

impl MetricsSnapshot {
    pub fn dead_lettered(&self) -> u64 {
        self.validation_failed
            + self.extraction_failed
            + self.unmatched
            + self.future_date
            + self.store_write_exhausted
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self, reason: DeadLetterReason) {
        let counter = match reason {
            DeadLetterReason::ValidationFailed => &self.validation_failed,
            DeadLetterReason::ExtractionFailed => &self.extraction_failed,
            DeadLetterReason::Unmatched => &self.unmatched,
            DeadLetterReason::FutureDate => &self.future_date,
            DeadLetterReason::StoreWriteExhausted => &self.store_write_exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            validation_failed: self.validation_failed.load(Ordering::Relaxed),
            extraction_failed: self.extraction_failed.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            future_date: self.future_date.load(Ordering::Relaxed),
            store_write_exhausted: self.store_write_exhausted.load(Ordering::Relaxed),
        }
    }
}
