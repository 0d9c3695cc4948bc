//! Traits for log mining backends and event consumers
//!
//! The mining core is written once against [`LogMiningBackend`]. Each
//! database provides one implementation that knows its metadata views,
//! registration calls and session primitives. Everything above the trait
//! (catalog reconciliation, windowing, decoding, recovery) is shared.

use crate::common::{
    CdcError, ChangeEvent, CompiledFilter, Dialect, LogSegment, MiningPredicate, MiningWindow,
    PositionToken, RawBatch, Result, SqlConnection,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capability interface implemented once per database.
///
/// Every method receives the connection the orchestrator acquired for the
/// current attempt. Implementations hold no connection of their own.
#[async_trait]
pub trait LogMiningBackend: Send + Sync {
    /// Short source label ("oracle", "postgres")
    fn name(&self) -> &'static str;

    /// Identifier folding and bind syntax for filter compilation
    fn dialect(&self) -> Dialect;

    /// One-time setup per attempt (replication slot creation and the like).
    async fn prepare(&self, _conn: &dyn SqlConnection) -> Result<()> {
        Ok(())
    }

    /// Redo thread or timeline this instance writes.
    async fn current_thread(&self, conn: &dyn SqlConnection) -> Result<u32>;

    /// Online (live tier) segments.
    async fn online_segments(&self, conn: &dyn SqlConnection) -> Result<Vec<LogSegment>>;

    /// Archived segments that may hold positions at or after `from`.
    ///
    /// `retention_hours == 0` means no age limit.
    async fn archived_segments(
        &self,
        conn: &dyn SqlConnection,
        from: &PositionToken,
        retention_hours: u32,
    ) -> Result<Vec<LogSegment>>;

    /// Lowest position still minable on `thread`; `Null` when nothing is
    /// retained.
    async fn earliest_position(&self, conn: &dyn SqlConnection, thread: u32)
        -> Result<PositionToken>;

    /// Highest position currently written.
    async fn highest_position(&self, conn: &dyn SqlConnection) -> Result<PositionToken>;

    /// Resolve a compiled name filter to backend object ids.
    async fn resolve_object_ids(
        &self,
        conn: &dyn SqlConnection,
        filter: &CompiledFilter,
    ) -> Result<Vec<i64>>;

    /// Register one segment. `new_set` starts a fresh registration set.
    async fn register_segment(
        &self,
        conn: &dyn SqlConnection,
        segment: &LogSegment,
        new_set: bool,
    ) -> Result<()>;

    /// Start a mining session over the window range.
    async fn open_session(&self, conn: &dyn SqlConnection, window: &MiningWindow) -> Result<()>;

    /// Pull the next batch of raw records from the open session.
    async fn pull_raw(
        &self,
        conn: &dyn SqlConnection,
        window: &MiningWindow,
        predicate: &MiningPredicate,
    ) -> Result<RawBatch>;

    /// Stop the session.
    async fn close_session(&self, conn: &dyn SqlConnection) -> Result<()>;

    /// Report the acknowledged position so the database can reclaim log.
    async fn send_feedback(&self, _conn: &dyn SqlConnection, _position: &PositionToken) -> Result<()> {
        Ok(())
    }
}

/// Downstream receiver of change events.
///
/// An `Err` is backpressure: the same event is offered again and the
/// position does not move past it. The orchestrator calls `accept` from one
/// task only.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn accept(&self, event: &ChangeEvent) -> Result<()>;
}

/// Consumer that forwards events into a bounded channel.
///
/// A full or closed channel rejects the event.
pub struct ChannelConsumer {
    tx: mpsc::Sender<ChangeEvent>,
    send_timeout: Option<Duration>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<ChangeEvent>) -> Self {
        Self {
            tx,
            send_timeout: None,
        }
    }

    /// Create a consumer and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Wait up to `timeout` for capacity before rejecting.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl EventConsumer for ChannelConsumer {
    async fn accept(&self, event: &ChangeEvent) -> Result<()> {
        match self.send_timeout {
            None => self.tx.try_send(event.clone()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CdcError::consumer_rejected("channel full"),
                mpsc::error::TrySendError::Closed(_) => {
                    CdcError::consumer_rejected("channel closed")
                }
            }),
            Some(timeout) => self
                .tx
                .send_timeout(event.clone(), timeout)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => {
                        CdcError::consumer_rejected(format!("channel full after {:?}", timeout))
                    }
                    mpsc::error::SendTimeoutError::Closed(_) => {
                        CdcError::consumer_rejected("channel closed")
                    }
                }),
        }
    }
}

/// Consumer backed by a closure.
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F>
where
    F: Fn(&ChangeEvent) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> EventConsumer for FnConsumer<F>
where
    F: Fn(&ChangeEvent) -> Result<()> + Send + Sync,
{
    async fn accept(&self, event: &ChangeEvent) -> Result<()> {
        (self.f)(event)
    }
}
