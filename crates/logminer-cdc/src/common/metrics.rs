//! # Mining metrics
//!
//! Lock-free counters for one mining loop. Every update is also emitted to
//! the `metrics` crate facade under `logminer_cdc_*` names, labelled with
//! the source, so any installed recorder (Prometheus, StatsD) picks them up.

use crate::common::{OperationKind, PositionToken};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Metrics collector for one mining loop.
#[derive(Debug)]
pub struct MinerMetrics {
    source: String,

    events_delivered: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    ddl: AtomicU64,
    boundaries_skipped: AtomicU64,
    events_filtered: AtomicU64,
    payloads_skipped: AtomicU64,
    consumer_rejections: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,

    windows_opened: AtomicU64,
    last_window_duration_ms: AtomicU64,
    recoveries: AtomicU64,
    feedback_sent: AtomicU64,
    feedback_errors: AtomicU64,

    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl MinerMetrics {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            events_delivered: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            ddl: AtomicU64::new(0),
            boundaries_skipped: AtomicU64::new(0),
            events_filtered: AtomicU64::new(0),
            payloads_skipped: AtomicU64::new(0),
            consumer_rejections: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transactions_rolled_back: AtomicU64::new(0),
            windows_opened: AtomicU64::new(0),
            last_window_duration_ms: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            feedback_sent: AtomicU64::new(0),
            feedback_errors: AtomicU64::new(0),
            running: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record an event accepted by the consumer.
    pub fn record_delivered(&self, op: OperationKind, position: PositionToken) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        let per_op = match op {
            OperationKind::Insert => Some(&self.inserts),
            OperationKind::Update => Some(&self.updates),
            OperationKind::Delete => Some(&self.deletes),
            OperationKind::Ddl => Some(&self.ddl),
            OperationKind::Commit | OperationKind::Rollback => None,
        };
        if let Some(counter) = per_op {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        metrics::counter!(
            "logminer_cdc_events_total",
            "source" => self.source.clone(),
            "op" => op.as_str()
        )
        .increment(1);
        if let Some(pos) = position.to_i64() {
            metrics::gauge!("logminer_cdc_position", "source" => self.source.clone())
                .set(pos as f64);
        }
    }

    pub fn record_boundary_skipped(&self) {
        self.boundaries_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("logminer_cdc_boundaries_total", "source" => self.source.clone())
            .increment(1);
    }

    /// Record an event dropped by the object filter.
    pub fn record_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("logminer_cdc_filtered_total", "source" => self.source.clone())
            .increment(1);
    }

    /// Record raw records that decoded to nothing.
    pub fn record_payloads_skipped(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.payloads_skipped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("logminer_cdc_payloads_skipped_total", "source" => self.source.clone())
            .increment(count);
    }

    pub fn record_consumer_rejection(&self) {
        self.consumer_rejections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "logminer_cdc_consumer_rejections_total",
            "source" => self.source.clone()
        )
        .increment(1);
    }

    /// Record transactions released or discarded by the transaction buffer.
    pub fn record_transactions(&self, committed: u64, rolled_back: u64) {
        if committed > 0 {
            self.transactions_committed
                .fetch_add(committed, Ordering::Relaxed);
            metrics::counter!(
                "logminer_cdc_transactions_total",
                "source" => self.source.clone(),
                "outcome" => "commit"
            )
            .increment(committed);
        }
        if rolled_back > 0 {
            self.transactions_rolled_back
                .fetch_add(rolled_back, Ordering::Relaxed);
            metrics::counter!(
                "logminer_cdc_transactions_total",
                "source" => self.source.clone(),
                "outcome" => "rollback"
            )
            .increment(rolled_back);
        }
    }

    pub fn record_window_opened(&self) {
        self.windows_opened.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("logminer_cdc_windows_total", "source" => self.source.clone())
            .increment(1);
    }

    pub fn record_window_closed(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.last_window_duration_ms.store(ms, Ordering::Relaxed);
        metrics::gauge!(
            "logminer_cdc_window_duration_seconds",
            "source" => self.source.clone()
        )
        .set(elapsed.as_secs_f64());
    }

    /// Record a restart after a retriable failure.
    pub fn record_recovery(&self, error_code: &'static str) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "logminer_cdc_recoveries_total",
            "source" => self.source.clone(),
            "error" => error_code
        )
        .increment(1);
    }

    pub fn record_feedback(&self, ok: bool) {
        if ok {
            self.feedback_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.feedback_errors.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "logminer_cdc_feedback_total",
            "source" => self.source.clone(),
            "result" => if ok { "ok" } else { "error" }
        )
        .increment(1);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        metrics::gauge!("logminer_cdc_running", "source" => self.source.clone())
            .set(if running { 1.0 } else { 0.0 });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message.into());
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            source: self.source.clone(),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            ddl: self.ddl.load(Ordering::Relaxed),
            boundaries_skipped: self.boundaries_skipped.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            payloads_skipped: self.payloads_skipped.load(Ordering::Relaxed),
            consumer_rejections: self.consumer_rejections.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            windows_opened: self.windows_opened.load(Ordering::Relaxed),
            last_window_duration_ms: self.last_window_duration_ms.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            feedback_sent: self.feedback_sent.load(Ordering::Relaxed),
            feedback_errors: self.feedback_errors.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

/// Point-in-time copy of [`MinerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub source: String,
    pub events_delivered: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub ddl: u64,
    pub boundaries_skipped: u64,
    pub events_filtered: u64,
    pub payloads_skipped: u64,
    pub consumer_rejections: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub windows_opened: u64,
    pub last_window_duration_ms: u64,
    pub recoveries: u64,
    pub feedback_sent: u64,
    pub feedback_errors: u64,
    pub running: bool,
    pub last_error: Option<String>,
}
