//! # PostgreSQL WAL backend
//!
//! Mines a `pgoutput` logical replication slot through the SQL slot
//! functions, so the mining loop needs only an ordinary connection.
//!
//! | Concept | PostgreSQL |
//! |---------|------------|
//! | Position | LSN as a byte offset (`pg_wal_lsn_diff(lsn, '0/0')`) |
//! | Thread | Timeline |
//! | Online segments | `pg_ls_waldir()` up to the current insert file |
//! | Archived segments | `.done` entries of `pg_ls_archive_statusdir()` |
//! | Session | `pg_logical_slot_peek_binary_changes` up to the window end |
//! | Feedback | `pg_replication_slot_advance` |
//!
//! Every message of a transaction carries the transaction's commit
//! location, so a window holds whole transactions and resuming from a
//! checkpoint never splits one.
//!
//! Requires PostgreSQL 12+ with `wal_level = logical`. Listing the WAL and
//! archive status directories needs superuser or `pg_monitor`.

mod backend;
mod client;
mod statements;

pub use backend::{
    parse_wal_file_name, PostgresMinerConfig, PostgresMinerConfigBuilder, PostgresWalMiner,
    DEFAULT_SLOT_NAME,
};
pub use client::{PgConnection, PgConnectionSupplier};
