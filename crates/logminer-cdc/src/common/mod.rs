//! # Backend-neutral mining core
//!
//! - [`PositionToken`] - Ordered log position with `Null`/`Max` sentinels
//! - [`LogSegment`] / [`LogSegmentCatalog`] - Segment discovery and
//!   online/archived reconciliation
//! - [`FilterCompiler`] - Name patterns to chunked object-id predicates
//! - [`MiningWindowScheduler`] - Bounded mining session lifecycle
//! - [`ChangeEventDecoder`] - Raw rows and pgoutput payloads to [`ChangeEvent`]s
//! - [`TransactionBuffer`] - Holds row changes until commit, tracks the
//!   low-water resume position
//! - [`StreamOrchestrator`] - The resumable loop tying it together
//! - [`LogMiningBackend`] - Capability interface implemented per database
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  StreamOrchestrator                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LogSegmentCatalog     ←─── online + archived, ONLINE wins  │
//! │  FilterCompiler        ←─── patterns → id IN (≤998) chunks  │
//! │  MiningWindowScheduler ←─── register → open → pull → close  │
//! │  ChangeEventDecoder    ←─── continuation join, pgoutput     │
//! │  TransactionBuffer     ←─── commit-ordered release          │
//! │  CheckpointStore       ←─── monotonic acknowledged position │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LogMiningBackend      ←─── OracleLogMiner, PostgresWalMiner│
//! │  SqlConnection         ←─── driver adapters                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod catalog;
mod checkpoint;
mod config;
mod connection;
mod decoder;
mod error;
mod event;
mod filter;
mod metrics;
mod orchestrator;
pub mod pgoutput;
mod position;
mod resilience;
mod segment;
mod traits;
mod transaction;
mod window;

pub use catalog::{reconcile, LogSegmentCatalog};
pub use checkpoint::{CheckpointRecord, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{AckPolicy, MinerConfig, MinerConfigBuilder, MIN_POLL_INTERVAL_MS};
pub use connection::{ConnectionSupplier, RowStream, SqlConnection, SqlRow, SqlValue, VecRowStream};
#[cfg(test)]
pub(crate) use connection::scripted;
pub use decoder::{
    op_codes, ChangeEventDecoder, DecoderStats, MiningRow, RawBatch, RawRecord, ReplicationPayload,
};
pub use error::{CdcError, ErrorCategory, Result};
pub use event::{ChangeEvent, ChangePayload, OperationKind};
pub use filter::{
    chunk_object_ids, CompiledFilter, Dialect, FilterCompiler, FilterMode, MiningPredicate,
    ObjectIdPredicate, ObjectPattern, Polarity, SqlFragment, MAX_CHUNK_CARDINALITY,
};
pub use metrics::{MetricsSnapshot, MinerMetrics};
pub use orchestrator::{MinerHandle, StreamOrchestrator};
pub use position::PositionToken;
pub use resilience::ExponentialBackoff;
pub use segment::{LogSegment, SegmentKey, SegmentKind};
pub use traits::{ChannelConsumer, EventConsumer, FnConsumer, LogMiningBackend};
pub use transaction::{TransactionBatch, TransactionBuffer, TransactionStats};
pub use window::{
    window_upper_bound, MiningWindow, MiningWindowScheduler, SchedulerState,
    DEFAULT_WINDOW_INCREMENT,
};
