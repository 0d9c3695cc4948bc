//! # logminer-cdc - log mining change data capture
//!
//! Extracts row-level changes from a database's transaction log (Oracle
//! redo through LogMiner, PostgreSQL WAL through a logical replication slot)
//! as an ordered, resumable event stream.
//!
//! ## Features
//!
//! - `oracle` - LogMiner capability over any [`SqlConnection`] adapter
//! - `postgres` - WAL capability plus a `tokio-postgres` connection adapter
//! - `full` - Both backends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐        ┌──────────────┐
//! │ Oracle redo │        │PostgreSQL WAL│
//! │  LogMiner   │        │ pgoutput slot│
//! └──────┬──────┘        └──────┬───────┘
//!        ▼                      ▼
//! ┌──────────────────────────────────────┐
//! │          LogMiningBackend            │
//! └──────────────────────────────────────┘
//!        │  segments, sessions, raw rows
//!        ▼
//! ┌──────────────────────────────────────┐
//! │ catalog → filter → window → decoder  │
//! │          StreamOrchestrator          │
//! └──────────────────────────────────────┘
//!        │  ChangeEvent (position order)
//!        ▼
//!   EventConsumer        CheckpointStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "postgres")]
//! # async fn example() -> anyhow::Result<()> {
//! use logminer_cdc::postgres::{PgConnectionSupplier, PostgresMinerConfig, PostgresWalMiner};
//! use logminer_cdc::{ChannelConsumer, MemoryCheckpointStore, MinerConfig, StreamOrchestrator};
//! use std::sync::Arc;
//!
//! let pg = PostgresMinerConfig::builder()
//!     .connection_string("host=localhost user=cdc password=secret dbname=shop")
//!     .publication("shop_pub")
//!     .build()?;
//! let supplier = Arc::new(PgConnectionSupplier::new(pg.connection_string.clone()));
//! let backend = Arc::new(PostgresWalMiner::new(pg));
//!
//! let config = MinerConfig::builder().include(["public.orders"]).build()?;
//! let (consumer, mut events) = ChannelConsumer::channel(1024);
//!
//! let handle = StreamOrchestrator::start(
//!     config,
//!     backend,
//!     supplier,
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(consumer),
//! )
//! .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {:?} at {}", event.op.as_str(), event.qualified_name(), event.position);
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;

#[cfg(feature = "oracle")]
pub mod oracle;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use common::{
    // Errors
    CdcError,
    Result,
    // Positions and segments
    LogSegment,
    PositionToken,
    SegmentKind,
    // Events
    ChangeEvent,
    ChangePayload,
    OperationKind,
    // Running a loop
    AckPolicy,
    MinerConfig,
    MinerHandle,
    StreamOrchestrator,
    // Collaborators
    ChannelConsumer,
    CheckpointStore,
    ConnectionSupplier,
    EventConsumer,
    FileCheckpointStore,
    LogMiningBackend,
    MemoryCheckpointStore,
    SqlConnection,
};
