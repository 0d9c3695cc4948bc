//! # Transaction buffering
//!
//! Row changes are held per transaction until the transaction's commit
//! boundary arrives, then released together, stamped with the commit
//! position. A rollback discards what was held. Events that carry no
//! transaction id are released immediately.
//!
//! The buffer also tracks the *low-water mark*: the highest position from
//! which mining can restart without losing any change of a transaction that
//! has not been fully delivered yet.
//!
//! ```text
//!   low_water = min(scanned, first position of every open transaction)
//! ```
//!
//! `scanned` is the highest record position consumed so far. Restarting at
//! the low-water mark (inclusive) re-reads every open transaction from its
//! first row; transactions already delivered may be offered again.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut buffer = TransactionBuffer::new(resume);
//! buffer.observe(record_position);
//! if let Some(batch) = buffer.push(event) {
//!     for event in &batch.events {
//!         deliver(event).await?;
//!         acknowledge(buffer.low_water().min_of(batch.start)).await?;
//!     }
//! }
//! ```

use crate::common::{ChangeEvent, OperationKind, PositionToken};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, trace};

/// Events released together: a committed transaction, or a single event
/// without a transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionBatch {
    /// Transaction id (None for pass-through events)
    pub transaction_id: Option<String>,
    /// Position of the first buffered event
    pub start: PositionToken,
    /// Commit position every event is stamped with
    pub commit: PositionToken,
    pub events: Vec<ChangeEvent>,
}

impl TransactionBatch {
    /// Wrap an event that belongs to no transaction.
    pub fn single(event: ChangeEvent) -> Self {
        Self {
            transaction_id: None,
            start: event.position,
            commit: event.position,
            events: vec![event],
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Counters kept by the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub committed: u64,
    pub rolled_back: u64,
    /// Events released without a transaction id
    pub pass_through: u64,
    /// Boundaries for transactions with nothing buffered
    pub unknown_boundaries: u64,
}

#[derive(Debug)]
struct OpenTransaction {
    start: PositionToken,
    events: Vec<ChangeEvent>,
    opened_at: Instant,
}

/// Per-transaction event buffer for one mining attempt.
///
/// Lives across windows: a transaction whose rows and commit fall into
/// different windows is assembled all the same.
#[derive(Debug)]
pub struct TransactionBuffer {
    open: HashMap<String, OpenTransaction>,
    scanned: PositionToken,
    stats: TransactionStats,
}

impl TransactionBuffer {
    /// Empty buffer for mining that resumes at `resume`.
    pub fn new(resume: PositionToken) -> Self {
        Self {
            open: HashMap::new(),
            scanned: resume,
            stats: TransactionStats::default(),
        }
    }

    /// Record that everything up to `position` has been read.
    pub fn observe(&mut self, position: PositionToken) {
        if !position.is_null() && !position.is_max() && position > self.scanned {
            self.scanned = position;
        }
    }

    /// Add a decoded event. Returns the events that became ready.
    pub fn push(&mut self, event: ChangeEvent) -> Option<TransactionBatch> {
        let Some(xid) = event.transaction_id.clone() else {
            if event.is_boundary() {
                self.stats.unknown_boundaries += 1;
                return None;
            }
            self.stats.pass_through += 1;
            return Some(TransactionBatch::single(event));
        };

        match event.op {
            OperationKind::Commit => self.commit(xid, event.position),
            OperationKind::Rollback => {
                self.rollback(&xid);
                None
            }
            _ => {
                let position = event.position;
                self.open
                    .entry(xid)
                    .or_insert_with(|| OpenTransaction {
                        start: position,
                        events: Vec::new(),
                        opened_at: Instant::now(),
                    })
                    .events
                    .push(event);
                None
            }
        }
    }

    fn commit(&mut self, xid: String, position: PositionToken) -> Option<TransactionBatch> {
        let Some(txn) = self.open.remove(&xid) else {
            trace!("Commit at {} for transaction {} with nothing buffered", position, xid);
            self.stats.unknown_boundaries += 1;
            return None;
        };
        self.stats.committed += 1;

        let mut events = txn.events;
        for event in &mut events {
            event.position = position;
        }
        debug!(
            "Transaction {} committed at {} with {} events (open {:?})",
            xid,
            position,
            events.len(),
            txn.opened_at.elapsed()
        );
        Some(TransactionBatch {
            transaction_id: Some(xid),
            start: txn.start,
            commit: position,
            events,
        })
    }

    fn rollback(&mut self, xid: &str) {
        match self.open.remove(xid) {
            Some(txn) => {
                self.stats.rolled_back += 1;
                debug!(
                    "Transaction {} rolled back, discarding {} events",
                    xid,
                    txn.events.len()
                );
            }
            None => self.stats.unknown_boundaries += 1,
        }
    }

    /// Highest position safe to resume from.
    pub fn low_water(&self) -> PositionToken {
        self.open
            .values()
            .map(|t| t.start)
            .fold(self.scanned, PositionToken::min_of)
    }

    /// Highest position consumed so far.
    pub fn scanned(&self) -> PositionToken {
        self.scanned
    }

    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }

    pub fn buffered_events(&self) -> usize {
        self.open.values().map(|t| t.events.len()).sum()
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }
}
