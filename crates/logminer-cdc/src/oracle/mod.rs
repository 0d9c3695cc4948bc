//! # Oracle LogMiner backend
//!
//! Mines redo through `DBMS_LOGMNR` over any [`SqlConnection`] adapter.
//!
//! ## Session lifecycle
//!
//! ```text
//! V$LOG + V$ARCHIVED_LOG ──▶ ADD_LOGFILE (NEW, ADDFILE, ...)
//!                                  │
//!                                  ▼
//!            START_LOGMNR(STARTSCN=lower, ENDSCN=upper-1)
//!                                  │
//!                                  ▼
//!                  SELECT ... FROM V$LOGMNR_CONTENTS
//!                                  │
//!                                  ▼
//!                             END_LOGMNR
//! ```
//!
//! Sessions use the online catalog as dictionary and committed data only, so
//! rows arrive grouped by transaction in commit order.
//!
//! ## Multitenant databases
//!
//! With `cdb` set the backend resolves objects through `CDB_OBJECTS` and,
//! unless disabled, restricts mined rows to pluggable containers.
//!
//! [`SqlConnection`]: crate::common::SqlConnection

mod backend;
mod statements;

pub use backend::{OracleLogMiner, OracleMinerConfig, OracleMinerConfigBuilder};
